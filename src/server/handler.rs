//! # Contrato del Handler de Conexión
//! src/server/handler.rs
//!
//! El front-end no sabe hablar ningún protocolo: para cada despacho de una
//! conexión construye un handler con la fábrica registrada y le entrega el
//! socket. El handler lee, responde y dice si la conexión debe cerrarse.

use std::net::{SocketAddr, TcpStream};

use crate::error::HandlerError;

/// Resultado de un handler: `Ok(true)` = cerrar, `Ok(false)` = keep-alive
pub type HandlerResult = Result<bool, HandlerError>;

/// Handler de una conexión
pub trait ConnectionHandler {
    /// Lee del socket y responde
    fn handle(&mut self, stream: &mut TcpStream) -> HandlerResult;
}

/// Fábrica de handlers, compartida entre el loop y los workers
pub trait HandlerFactory: Send + Sync {
    fn create(&self, peer: SocketAddr) -> Box<dyn ConnectionHandler>;
}

/// Un closure sirve como handler
impl<F> ConnectionHandler for F
where
    F: FnMut(&mut TcpStream) -> HandlerResult,
{
    fn handle(&mut self, stream: &mut TcpStream) -> HandlerResult {
        self(stream)
    }
}
