//! # Logging
//! src/logging.rs
//!
//! Instala el subscriber de `tracing` una sola vez por proceso. `RUST_LOG`
//! tiene prioridad; si no está, el nivel sale de `--debug`:
//!
//! | debug | filtro  |
//! |-------|---------|
//! | 0     | `info`  |
//! | 1     | `debug` |
//! | 2     | `trace` |

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filtro por defecto para un nivel de debug
pub fn default_filter(debug: u8) -> &'static str {
    match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Handle del logging del proceso
#[derive(Debug, Default)]
pub struct Logging {
    closed: AtomicBool,
}

impl Logging {
    /// Instala el subscriber global
    ///
    /// Si ya había uno (tests, varios procesos en el mismo binario) se usa
    /// el existente.
    pub fn init(debug: u8) -> Self {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(debug)));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init();
        Self::default()
    }

    /// Handle sin subscriber (tests)
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Vacía la salida y marca el logging como cerrado; idempotente
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Cerrando logging");
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_levels() {
        assert_eq!(default_filter(0), "info");
        assert_eq!(default_filter(1), "debug");
        assert_eq!(default_filter(2), "trace");
    }

    #[test]
    fn test_close_is_idempotent() {
        let logging = Logging::detached();
        assert!(!logging.is_closed());
        logging.close();
        logging.close();
        assert!(logging.is_closed());
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        let _first = Logging::init(0);
        let second = Logging::init(2);
        assert!(!second.is_closed());
    }
}
