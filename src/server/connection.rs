//! # Estado de una Conexión
//! src/server/connection.rs
//!
//! Una instancia por socket aceptado. Transiciones:
//!
//! ```text
//! aceptada → registrada → (readable) → despachada → cerrada
//!                ▲                          │
//!                └──────── keep-alive ──────┘
//! ```
//!
//! En cada instante la conexión está registrada en el event loop **o** es
//! propiedad de un único worker. Como el estado se mueve (no se comparte),
//! el compilador garantiza que nunca son las dos cosas.
//!
//! El cierre está garantizado por `Drop`: si la conexión se descarta por
//! cualquier camino (error, panic en un worker, tarea descartada) se hace
//! half-close de escritura y luego se cierra el socket.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use tracing::trace;

use super::poller::Token;

/// Fase actual de la conexión
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Recién aceptada, todavía sin token
    Accepted,
    /// En el set de readiness del event loop
    Registered,
    /// En manos de un worker o del procesamiento inline
    Dispatched,
}

/// Estado de una conexión de cliente
#[derive(Debug)]
pub struct ConnectionState {
    stream: TcpStream,
    peer: SocketAddr,
    token: Option<Token>,
    phase: Phase,
    should_close: bool,
    /// Requests servidos sobre esta conexión
    served: u64,
}

impl ConnectionState {
    /// Envuelve un socket recién aceptado
    ///
    /// El socket se pasa a modo bloqueante: el handler solo corre cuando
    /// hay datos listos y lee/escribe de forma secuencial.
    pub fn accepted(stream: TcpStream, peer: SocketAddr) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        Ok(Self {
            stream,
            peer,
            token: None,
            phase: Phase::Accepted,
            should_close: false,
            served: 0,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Puerto del cliente (para diagnósticos)
    pub fn peer_port(&self) -> u16 {
        self.peer.port()
    }

    pub fn should_close(&self) -> bool {
        self.should_close
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn mark_registered(&mut self, token: Token) {
        self.token = Some(token);
        self.phase = Phase::Registered;
    }

    pub(crate) fn mark_dispatched(&mut self) {
        self.phase = Phase::Dispatched;
    }

    /// Guarda el resultado del handler
    pub(crate) fn finish_request(&mut self, should_close: bool) {
        self.served += 1;
        self.should_close = should_close;
    }

    /// Cierra la conexión: half-close de escritura y close
    pub fn close(self) {
        trace!(peer = %self.peer, token = ?self.token, phase = ?self.phase, served = self.served, "Cerrando conexión");
        drop(self);
    }
}

impl AsRawFd for ConnectionState {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        // El cliente puede haberse ido ya; el error no importa
        let _ = self.stream.shutdown(Shutdown::Write);
    }
}
