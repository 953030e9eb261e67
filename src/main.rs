//! # HTTP Front-end - Entry Point
//! src/main.rs
//!
//! Punto de entrada del servidor.
//!
//! ```text
//! http_frontend --mode bg --port 8080 --workers 8
//! FRONTEND_MODE=fg FRONTEND_DEBUG=1 http_frontend
//! ```
//!
//! SIGINT y SIGTERM activan el flag de interrupción del proceso; el event
//! loop lo ve en la siguiente vuelta y el proceso se apaga ordenadamente.

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::{error, info, warn};

use http_frontend::app::SiteApp;
use http_frontend::config::ServerConfig;
use http_frontend::error::{report, ServerError};
use http_frontend::logging::Logging;
use http_frontend::server::{Mode, ServerProcess};

/// Front-end de servidor HTTP
#[derive(Debug, Parser)]
#[command(name = "http_frontend", version, about)]
struct Cli {
    /// Modo de ejecución
    #[arg(long, value_enum, env = "FRONTEND_MODE", default_value = "bg")]
    mode: Mode,

    #[command(flatten)]
    config: ServerConfig,
}

fn main() {
    let cli = Cli::parse();
    let logging = Logging::init(cli.config.debug);

    info!("=================================");
    info!("  HTTP Front-end ({})", cli.mode.as_str());
    info!("=================================");

    let config = cli.config;
    let diagnostics = config.clone();

    let mut process = match ServerProcess::new(config, cli.mode, SiteApp::default(), logging) {
        Ok(process) => process,
        Err(e) => {
            error!(error = %report(&e), "Error al iniciar servidor");
            if matches!(e, ServerError::Bind { .. }) && diagnostics.port_in_use() {
                warn!(address = %diagnostics.address(), "El puerto ya está en uso por otro proceso");
            }
            std::process::exit(1);
        }
    };

    for signal in [SIGINT, SIGTERM] {
        if let Err(e) = flag::register(signal, process.interrupt_handle()) {
            error!(signal, error = %e, "No se pudo registrar el handler de señal");
            std::process::exit(1);
        }
    }

    let status = process.run();
    std::process::exit(status.code());
}
