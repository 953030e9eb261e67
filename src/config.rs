//! # Configuración del Servidor
//! src/config.rs
//!
//! Define la configuración del front-end con soporte para argumentos CLI y
//! variables de entorno. Se valida una sola vez, antes de abrir el socket de
//! escucha, y es de solo lectura a partir de ahí.
//!
//! ## Ejemplos de uso
//!
//! ### CLI
//! ```bash
//! ./http_frontend --mode bg --port 8080 \
//!   --workers 8 \
//!   --hung-threshold 60 \
//!   --kill-threshold 120
//! ```
//!
//! ### Variables de entorno
//! ```bash
//! FRONTEND_PORT=8080 FRONTEND_ADDRESS=0.0.0.0 ./http_frontend
//! ```

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use clap::Args;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use crate::error::ConfigError;

/// Versión mínima que se anuncia en el status line
const BASE_PROTOCOL_VERSION: &str = "1.1";

/// Configuración del front-end
#[derive(Debug, Clone, Args)]
pub struct ServerConfig {
    /// Host/IP en el que escucha
    #[arg(long, default_value = "127.0.0.1", env = "FRONTEND_ADDRESS")]
    pub address: String,

    /// Puerto en el que escucha el servidor
    #[arg(short, long, default_value = "8080", env = "FRONTEND_PORT")]
    pub port: u16,

    /// Esquema con el que el servidor es visible desde afuera
    #[arg(long, default_value = "http", env = "FRONTEND_PROTOCOL")]
    pub protocol: String,

    /// Versión del protocolo anunciada en las respuestas
    #[arg(long = "protocol-version", default_value = "1.1", env = "FRONTEND_PROTOCOL_VERSION")]
    pub protocol_version: String,

    /// Tamaño de la cola de conexiones pendientes (listen backlog)
    #[arg(long, default_value = "64", env = "FRONTEND_BACKLOG")]
    pub backlog: i32,

    /// Timeout del poll de readiness en milisegundos
    #[arg(long = "poll-interval", default_value = "1000", env = "FRONTEND_POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,

    /// Nivel de debug: 0 = silencioso, 1 = trazas de I/O, 2 = trazas del loop y accept
    #[arg(long, default_value = "0", env = "FRONTEND_DEBUG")]
    pub debug: u8,

    // === Workers ===

    /// Número inicial de workers del pool
    #[arg(long, default_value = "5", env = "FRONTEND_WORKERS")]
    pub workers: usize,

    /// Requests servidos por un worker antes de reemplazarlo (0 = sin límite)
    #[arg(long = "max-requests", default_value = "1000", env = "FRONTEND_MAX_REQUESTS")]
    pub max_requests_per_worker: u64,

    /// Segundos ocupado a partir de los cuales un worker se considera colgado
    #[arg(long = "hung-threshold", default_value = "60", env = "FRONTEND_HUNG_THRESHOLD")]
    pub hung_threshold_secs: u64,

    /// Segundos ocupado a partir de los cuales un worker se mata (0 = desactivado)
    #[arg(long = "kill-threshold", default_value = "0", env = "FRONTEND_KILL_THRESHOLD")]
    pub kill_threshold_secs: u64,

    /// Segundos de gracia para que un worker matado desaparezca
    #[arg(long = "kill-grace", default_value = "5", env = "FRONTEND_KILL_GRACE")]
    pub kill_grace_secs: u64,

    /// Si quedan menos workers libres que este número, se crean nuevos
    #[arg(long = "spawn-under", default_value = "2", env = "FRONTEND_SPAWN_UNDER")]
    pub spawn_under: usize,

    /// Cantidad de zombies a partir de la cual el proceso termina (0 = desactivado)
    #[arg(long = "zombie-limit", default_value = "0", env = "FRONTEND_ZOMBIE_LIMIT")]
    pub zombie_limit: usize,

    /// Cada cuántos requests se revisan workers colgados y zombies
    #[arg(long = "check-interval", default_value = "100", env = "FRONTEND_CHECK_INTERVAL")]
    pub check_interval: u64,
}

impl ServerConfig {
    /// Obtiene la dirección completa para bind (host:port)
    ///
    /// Las direcciones IPv6 se escriben entre corchetes.
    ///
    /// # Ejemplo
    /// ```rust
    /// use http_frontend::config::ServerConfig;
    ///
    /// let config = ServerConfig::default();
    /// assert_eq!(config.address(), "127.0.0.1:8080");
    /// ```
    pub fn address(&self) -> String {
        format!("{}:{}", self.host_literal(), self.port)
    }

    /// Host tal como aparece en una URL
    fn host_literal(&self) -> String {
        if Self::is_ipv6(&self.address) && !self.address.starts_with('[') {
            format!("[{}]", self.address)
        } else {
            self.address.clone()
        }
    }

    /// Resuelve la dirección configurada a un `SocketAddr`
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        let host = self.address.trim_start_matches('[').trim_end_matches(']');
        (host, self.port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address found for {}", self.address),
            )
        })
    }

    /// Timeout del poll de readiness
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Valida la configuración
    ///
    /// Retorna la primera invariante violada junto con los valores culpables
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers <= 1 {
            return Err(ConfigError::TooFewWorkers { workers: self.workers });
        }

        if self.kill_threshold_secs != 0 && self.kill_threshold_secs < self.hung_threshold_secs {
            return Err(ConfigError::KillBelowHung {
                kill: self.kill_threshold_secs,
                hung: self.hung_threshold_secs,
            });
        }

        if self.spawn_under > self.workers {
            return Err(ConfigError::SpawnUnderAboveWorkers {
                spawn_under: self.spawn_under,
                workers: self.workers,
            });
        }

        // Un timeout de 0 hace que el loop gire en vacío
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval(self.poll_interval_ms));
        }

        if self.debug > 2 {
            return Err(ConfigError::DebugLevel(self.debug));
        }

        Ok(())
    }

    /// true si la dirección parece IPv6 (más de un ':' o un corchete)
    ///
    /// Solo sirve para elegir la familia del socket, no es un parser.
    pub fn is_ipv6(address: &str) -> bool {
        address.matches(':').count() > 1 || address.contains('[') || address.contains(']')
    }

    /// Construye la URL base visible desde afuera
    ///
    /// Con `use_relative` retorna una base vacía. Si el servidor está detrás
    /// de un reverse proxy se respetan `X-Forwarded-Host`, `X-Forwarded-Proto`
    /// y `X-Forwarded-Prefix`.
    ///
    /// # Ejemplo
    /// ```rust
    /// use std::collections::HashMap;
    /// use http_frontend::config::ServerConfig;
    ///
    /// let config = ServerConfig::default();
    /// let mut headers = HashMap::new();
    /// headers.insert("X-Forwarded-Host".to_string(), "example.org".to_string());
    /// headers.insert("X-Forwarded-Proto".to_string(), "https".to_string());
    ///
    /// assert_eq!(config.resolve_external_url(&headers, false), "https://example.org");
    /// assert_eq!(config.resolve_external_url(&headers, true), "");
    /// ```
    pub fn resolve_external_url(&self, headers: &HashMap<String, String>, use_relative: bool) -> String {
        if use_relative {
            return String::new();
        }

        let scheme = header(headers, "X-Forwarded-Proto").unwrap_or(&self.protocol);
        let host = match header(headers, "X-Forwarded-Host") {
            Some(host) => host.to_string(),
            None => self.address(),
        };

        let mut url = format!("{}://{}", scheme, host);

        if let Some(prefix) = header(headers, "X-Forwarded-Prefix") {
            let prefix = prefix.trim_matches('/');
            if !prefix.is_empty() {
                url.push('/');
                url.push_str(prefix);
            }
        }

        url
    }

    /// Versión del protocolo anunciada en el status line
    ///
    /// Cualquier versión mayor a 1.1 se reporta tal cual; el resto se
    /// normaliza a "1.1".
    pub fn protocol_version_string(&self) -> String {
        let declared = self.protocol_version.trim();
        match declared.parse::<f64>() {
            Ok(version) if version > 1.1 => declared.to_string(),
            _ => BASE_PROTOCOL_VERSION.to_string(),
        }
    }

    /// Prueba si el puerto configurado ya está ocupado
    ///
    /// Es un diagnóstico best-effort: solo "address already in use" cuenta
    /// como ocupado, cualquier otro fallo se reporta como libre.
    pub fn port_in_use(&self) -> bool {
        let Ok(addr) = self.socket_addr() else {
            return false;
        };

        let domain = if Self::is_ipv6(&self.address) { Domain::IPV6 } else { Domain::for_address(addr) };
        let Ok(socket) = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) else {
            return false;
        };

        if socket.set_reuse_address(true).is_err() {
            return false;
        }

        match socket.bind(&addr.into()) {
            Err(e) => e.kind() == io::ErrorKind::AddrInUse,
            Ok(()) => false,
        }
    }

    /// Registra un resumen de la configuración
    pub fn log_summary(&self) {
        info!(
            address = %self.address(),
            protocol = %self.protocol,
            version = %self.protocol_version_string(),
            backlog = self.backlog,
            poll_interval_ms = self.poll_interval_ms,
            debug = self.debug,
            "Configuración de red"
        );
        info!(
            workers = self.workers,
            max_requests = self.max_requests_per_worker,
            hung_threshold_secs = self.hung_threshold_secs,
            kill_threshold_secs = self.kill_threshold_secs,
            kill_grace_secs = self.kill_grace_secs,
            spawn_under = self.spawn_under,
            zombie_limit = self.zombie_limit,
            check_interval = self.check_interval,
            "Configuración del pool de workers"
        );
    }
}

/// Busca un header sin distinguir mayúsculas
fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

impl Default for ServerConfig {
    /// Configuración por defecto
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8080,
            protocol: "http".to_string(),
            protocol_version: BASE_PROTOCOL_VERSION.to_string(),
            backlog: 64,
            poll_interval_ms: 1000,
            debug: 0,
            workers: 5,
            max_requests_per_worker: 1000,
            hung_threshold_secs: 60,
            kill_threshold_secs: 0,
            kill_grace_secs: 5,
            spawn_under: 2,
            zombie_limit: 0,
            check_interval: 100,
        }
    }
}
