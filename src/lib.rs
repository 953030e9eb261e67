//! # HTTP Front-end
//! src/lib.rs
//!
//! Front-end de servidor de un solo proceso: un event loop multiplexa la
//! readiness del socket de escucha y de las conexiones de clientes, y
//! despacha cada conexión legible a procesamiento inline o a un pool de
//! workers. Incluye un ciclo de vida controlado (arranque, apagado ordenado,
//! aborto) y un hook de trabajos periódicos que corre en el mismo loop.
//!
//! ## Arquitectura
//!
//! - `server`: event loop, despacho, ciclo de vida del proceso
//! - `workers`: contrato del pool y pool de threads
//! - `jobs`: hook de trabajos periódicos y scheduler con nombre
//! - `config`: configuración (CLI + variables de entorno) y validación
//! - `url`: construcción de URLs externas
//! - `error`: taxonomía de errores
//! - `logging`: subscriber de `tracing`
//! - `metrics`: contadores del front-end
//! - `http`, `router`, `commands`, `app`: la aplicación HTTP por defecto
//!
//! ## Ejemplo de uso
//!
//! ```no_run
//! use http_frontend::app::SiteApp;
//! use http_frontend::config::ServerConfig;
//! use http_frontend::logging::Logging;
//! use http_frontend::server::{Mode, ServerProcess};
//!
//! let config = ServerConfig::default();
//! let logging = Logging::init(config.debug);
//! let mut process = ServerProcess::new(config, Mode::Bg, SiteApp::default(), logging)
//!     .expect("Error al iniciar servidor");
//! std::process::exit(process.run().code());
//! ```

pub mod app;
pub mod commands;
pub mod config;
pub mod error;
pub mod http;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod router;
pub mod server;
pub mod url;
pub mod workers;
