//! # Scheduler de Trabajos con Nombre
//! src/jobs/scheduler.rs
//!
//! Cada trabajo tiene un nombre y un período. En cada `poll()` se corren
//! los trabajos vencidos, en el orden en que se registraron. Un trabajo que
//! falla se registra en el log y se reprograma igual.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::Scheduler;

type JobAction = Box<dyn FnMut() -> Result<(), String> + Send>;

struct Job {
    name: String,
    period: Duration,
    next_run: Instant,
    runs: u64,
    failures: u64,
    last_error: Option<String>,
    action: JobAction,
}

/// Scheduler de trabajos periódicos
#[derive(Default)]
pub struct JobScheduler {
    jobs: Vec<Job>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un trabajo; la primera ejecución es después de un período
    pub fn every<F>(&mut self, name: impl Into<String>, period: Duration, action: F) -> &mut Self
    where
        F: FnMut() -> Result<(), String> + Send + 'static,
    {
        let name = name.into();
        debug!(job = %name, period_ms = period.as_millis() as u64, "Trabajo periódico registrado");
        self.jobs.push(Job {
            name,
            period,
            next_run: Instant::now() + period,
            runs: 0,
            failures: 0,
            last_error: None,
            action: Box::new(action),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Corre los trabajos vencidos a `now`
    fn run_due(&mut self, now: Instant) {
        for job in self.jobs.iter_mut().filter(|job| job.next_run <= now) {
            job.runs += 1;
            match (job.action)() {
                Ok(()) => {
                    if let Some(previous) = job.last_error.take() {
                        info!(job = %job.name, previous = %previous, "Trabajo periódico recuperado");
                    }
                }
                Err(e) => {
                    job.failures += 1;
                    warn!(job = %job.name, runs = job.runs, failures = job.failures, error = %e, "Trabajo periódico falló");
                    job.last_error = Some(e);
                }
            }
            // Sin ráfagas de recuperación: se reprograma desde ahora
            job.next_run = now + job.period;
        }
    }
}

impl Scheduler for JobScheduler {
    fn poll(&mut self) {
        self.run_due(Instant::now());
    }
}
