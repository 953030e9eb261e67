//! # Contadores del Servidor
//! src/metrics/collector.rs
//!
//! Contadores thread-safe de la vida del servidor: conexiones registradas
//! en el event loop, aceptadas, cerradas, requests servidos e iteraciones
//! del loop. Solo se usan para observabilidad (página de status, logs).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Contadores del servidor
#[derive(Debug)]
pub struct ServerStats {
    /// Conexiones actualmente registradas (sin contar el listener)
    registered: AtomicUsize,
    accepted: AtomicU64,
    closed: AtomicU64,
    requests: AtomicU64,
    loop_iterations: AtomicU64,
    start_time: Instant,
}

/// Foto de los contadores en un instante
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub registered_connections: usize,
    pub accepted_connections: u64,
    pub closed_connections: u64,
    pub requests_served: u64,
    pub loop_iterations: u64,
    pub uptime_secs: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            registered: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            loop_iterations: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Publica la cantidad de conexiones registradas
    pub fn set_registered(&self, count: usize) {
        self.registered.store(count, Ordering::Relaxed);
    }

    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::Relaxed)
    }

    pub fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_iteration(&self) {
        self.loop_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            registered_connections: self.registered(),
            accepted_connections: self.accepted.load(Ordering::Relaxed),
            closed_connections: self.closed.load(Ordering::Relaxed),
            requests_served: self.requests.load(Ordering::Relaxed),
            loop_iterations: self.loop_iterations.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Contadores en formato JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}
