//! # Sistema de Métricas
//! src/metrics/mod.rs
//!
//! Contadores del front-end para observabilidad:
//! - Conexiones registradas en el event loop
//! - Conexiones aceptadas y cerradas
//! - Requests servidos
//! - Iteraciones del loop

pub mod collector;

pub use collector::{ServerStats, StatsSnapshot};
