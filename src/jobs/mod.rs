//! # Trabajos Periódicos
//! src/jobs/mod.rs
//!
//! El event loop llama a `Scheduler::poll()` una vez por iteración, después
//! de atender los eventos (haya habido o no). Ahí corren los trabajos
//! periódicos de la aplicación, siempre en el thread del loop.
//!
//! Un `poll()` tiene que ser corto: mientras corre, el loop no atiende
//! conexiones.

pub mod scheduler;

pub use scheduler::JobScheduler;

/// Hook de trabajos periódicos
pub trait Scheduler: Send {
    fn poll(&mut self);
}

/// Un closure sirve como scheduler
impl<F> Scheduler for F
where
    F: FnMut() + Send,
{
    fn poll(&mut self) {
        self()
    }
}

/// Scheduler que no hace nada (modos sin trabajos periódicos)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn poll(&mut self) {}
}
