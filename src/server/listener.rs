//! # Socket de Escucha
//! src/server/listener.rs
//!
//! Crea el socket de escucha con `socket2` para poder fijar SO_REUSEADDR y
//! el backlog antes de `listen`. El socket queda no bloqueante: el event
//! loop acepta solo cuando el multiplexor lo reporta legible.

use std::net::TcpListener;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Abre y pone a escuchar el socket configurado
pub fn bind(config: &ServerConfig) -> ServerResult<TcpListener> {
    let addr_text = config.address();
    let bind_err = |source| ServerError::Bind { addr: addr_text.clone(), source };

    let addr = config.socket_addr().map_err(bind_err)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(config.backlog).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let listener: TcpListener = socket.into();
    info!(address = %addr_text, backlog = config.backlog, "Socket de escucha abierto");
    Ok(listener)
}
