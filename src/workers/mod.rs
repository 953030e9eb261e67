//! # Pool de Workers
//! src/workers/mod.rs
//!
//! Contrato del pool que ejecuta el procesamiento de conexiones fuera del
//! thread del event loop, y una implementación basada en threads del
//! sistema operativo.
//!
//! ## Contrato
//!
//! - `add_task`: encola trabajo; nunca bloquea al que llama
//! - `shutdown`: deja de aceptar trabajo y espera al trabajo en curso
//! - `status`: resumen legible (para una página de administración)

pub mod pool;

pub use pool::{PoolConfig, PoolStatus, ThreadPool};

use crate::error::BoxError;

/// Resultado de una tarea; los errores los registra el pool
pub type TaskResult = Result<(), BoxError>;

/// Unidad de trabajo sin argumentos
pub type Task = Box<dyn FnOnce() -> TaskResult + Send + 'static>;

/// Contrato del pool de workers
pub trait WorkerPool: Send + Sync {
    fn add_task(&self, task: Task);

    fn shutdown(&self);

    fn status(&self) -> String;
}
