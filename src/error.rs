//! # Tipos de Error
//! src/error.rs
//!
//! Taxonomía de errores del front-end:
//!
//! - `ConfigError`: invariantes de configuración violadas (fatal al arrancar)
//! - `InitError`: fallos al construir subsistemas (modelo, base de datos, otros)
//! - `HandlerError`: lo que puede devolver un handler de conexión
//! - `SocketFailure`: clasificación de errores de socket a nivel de conexión
//! - `ServerError`: errores que cruzan la frontera del proceso

use std::error::Error;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Resultado para operaciones del servidor
pub type ServerResult<T> = Result<T, ServerError>;

/// Error genérico boxeado (tareas del pool, fallos de handler)
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Invariante de configuración violada
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("workers must be > 1 (workers = {workers})")]
    TooFewWorkers { workers: usize },

    #[error("kill threshold must be >= hung threshold (kill = {kill}s, hung = {hung}s)")]
    KillBelowHung { kill: u64, hung: u64 },

    #[error("spawn-under must be <= workers (spawn_under = {spawn_under}, workers = {workers})")]
    SpawnUnderAboveWorkers { spawn_under: usize, workers: usize },

    #[error("poll interval must be > 0 ms (poll_interval_ms = {0})")]
    ZeroPollInterval(u64),

    #[error("debug level must be 0, 1 or 2 (debug = {0})")]
    DebugLevel(u8),
}

/// Fallo durante la inicialización de subsistemas
#[derive(Debug, Error)]
pub enum InitError {
    /// Error reconocido al cargar el modelo de la aplicación
    #[error("model error: {0}")]
    Model(String),

    /// Error reconocido al abrir la base de datos
    #[error("database error: {0}")]
    Database(String),

    /// Cualquier otro fallo
    #[error("unexpected initialization error: {0}")]
    Unexpected(#[source] BoxError),
}

impl InitError {
    /// Los errores reconocidos se registran como un mensaje limpio, sin traza
    pub fn is_recognized(&self) -> bool {
        matches!(self, InitError::Model(_) | InitError::Database(_))
    }
}

/// Error devuelto por un handler de conexión
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Error de sistema operativo sobre el socket
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// Cualquier otro fallo del handler
    #[error("handler failure: {0}")]
    Failure(#[source] BoxError),
}

impl HandlerError {
    pub fn failure(err: impl Into<BoxError>) -> Self {
        HandlerError::Failure(err.into())
    }
}

/// Clasificación de un error de socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFailure {
    /// El cliente reinició la conexión
    PeerReset,
    /// Escritura sobre un socket cerrado por el otro extremo
    BrokenPipe,
    /// El endpoint ya no está conectado
    Stale,
    /// No se sabe recuperar a este nivel
    Unclassified,
}

impl SocketFailure {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset => SocketFailure::PeerReset,
            io::ErrorKind::BrokenPipe => SocketFailure::BrokenPipe,
            io::ErrorKind::NotConnected => SocketFailure::Stale,
            _ => SocketFailure::Unclassified,
        }
    }
}

/// Errores que cruzan la frontera del proceso
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("unclassified socket error (peer {peer}): {source}")]
    Socket {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("initialization failed: {0}")]
    Init(#[from] InitError),

    /// Fallo de la tarea única de los modos `clean` y `run`
    #[error("task failed: {0}")]
    Task(#[source] BoxError),
}

/// Renderiza un error con toda su cadena de causas
pub fn report(err: &(dyn Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
