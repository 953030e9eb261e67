//! # Handler HTTP
//! src/http/handler.rs
//!
//! Implementa el contrato de handler del front-end para HTTP: un handler por
//! despacho lee un request, lo rutea y escribe la respuesta. Devuelve si la
//! conexión debe cerrarse.
//!
//! - EOF antes del request o timeout de lectura: cerrar sin responder
//! - request malformado: 400 y cerrar
//! - headers demasiado largos: 413 y cerrar
//! - errores de escritura: se propagan como `HandlerError::Io` para que el
//!   despacho los clasifique
//!
//! Pipelining: si con el request llegaron bytes del siguiente, se sirven en
//! el mismo despacho, en orden. El loop solo vuelve a avisar cuando llegan
//! datos nuevos, así que nada puede quedar en el buffer al devolver la
//! conexión.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::request::head_end;
use super::{Method, Request, Response, StatusCode};
use crate::router::{Context, Router};
use crate::server::handler::{ConnectionHandler, HandlerFactory, HandlerResult};

/// Máximo de bytes de headers
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Máximo de bytes de body
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

const READ_CHUNK: usize = 4096;

/// Resultado de leer un request del socket
enum Incoming {
    Request(Request),
    /// El cliente cerró o no mandó nada a tiempo
    Gone,
    /// Responder con este error y cerrar
    Reject(Response),
}

/// Handler de un request HTTP
pub struct HttpHandler {
    peer: SocketAddr,
    router: Arc<Router>,
    context: Arc<Context>,
    version: String,
    read_timeout: Duration,
}

impl HttpHandler {
    /// Lee un request completo; sus bytes se consumen de `buffer` y lo que
    /// sobre queda para el siguiente
    fn read_request(&self, stream: &mut TcpStream, buffer: &mut Vec<u8>) -> io::Result<Incoming> {
        let mut chunk = [0u8; READ_CHUNK];

        let end = loop {
            if let Some(end) = head_end(buffer) {
                break end;
            }
            if buffer.len() > MAX_HEAD_SIZE {
                return Ok(Incoming::Reject(Response::error(StatusCode::PayloadTooLarge, "Request headers too large")));
            }
            match read_some(stream, &mut chunk)? {
                Some(0) | None => return Ok(Incoming::Gone),
                Some(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        };

        // El body se lee hasta el Content-Length declarado
        let declared = match Request::parse_head(&buffer[..end]).and_then(|head| head.content_length()) {
            Ok(declared) => declared,
            Err(e) => return Ok(Incoming::Reject(Response::error(StatusCode::BadRequest, &e.to_string()))),
        };
        if declared > MAX_BODY_SIZE {
            return Ok(Incoming::Reject(Response::error(StatusCode::PayloadTooLarge, "Request body too large")));
        }
        while buffer.len() < end + declared {
            match read_some(stream, &mut chunk)? {
                Some(0) | None => return Ok(Incoming::Gone),
                Some(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        }

        let parsed = Request::parse(&buffer[..end + declared]);
        buffer.drain(..end + declared);
        match parsed {
            Ok(request) => Ok(Incoming::Request(request)),
            Err(e) => Ok(Incoming::Reject(Response::error(StatusCode::BadRequest, &e.to_string()))),
        }
    }

    fn respond(&self, stream: &mut TcpStream, response: Response, keep_alive: bool) -> io::Result<()> {
        let response = response.with_header("Connection", if keep_alive { "keep-alive" } else { "close" });
        stream.write_all(&response.to_bytes(&self.version))?;
        stream.flush()
    }
}

impl ConnectionHandler for HttpHandler {
    fn handle(&mut self, stream: &mut TcpStream) -> HandlerResult {
        stream.set_read_timeout(Some(self.read_timeout))?;

        let mut buffer = Vec::with_capacity(READ_CHUNK);
        let mut served = 0usize;
        loop {
            let request = match self.read_request(stream, &mut buffer)? {
                Incoming::Request(request) => request,
                Incoming::Gone => {
                    trace!(peer = %self.peer, served, "Cliente cerró sin request");
                    return Ok(true);
                }
                Incoming::Reject(response) => {
                    debug!(peer = %self.peer, status = %response.status(), "Request rechazado");
                    self.respond(stream, response, false)?;
                    return Ok(true);
                }
            };

            let keep_alive = request.keep_alive();
            let mut response = self.router.route(&request, &self.context);
            if response.status().is_success() {
                self.context.hits.record(request.path());
            }
            if request.method() == Method::HEAD {
                response = response.without_body();
            }

            debug!(
                peer = %self.peer,
                method = request.method().as_str(),
                path = request.path(),
                status = response.status().as_u16(),
                keep_alive,
                pipelined = served > 0,
                "Request servido"
            );

            self.respond(stream, response, keep_alive)?;
            served += 1;

            if !keep_alive {
                return Ok(true);
            }
            if buffer.is_empty() {
                return Ok(false);
            }
        }
    }
}

/// Lee lo que haya; `None` si venció el timeout
fn read_some(stream: &mut TcpStream, chunk: &mut [u8]) -> io::Result<Option<usize>> {
    loop {
        match stream.read(chunk) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

/// Fábrica de `HttpHandler`, compartida por el loop y los workers
pub struct HttpHandlerFactory {
    router: Arc<Router>,
    context: Arc<Context>,
    version: String,
    read_timeout: Duration,
}

impl HttpHandlerFactory {
    pub fn new(router: Arc<Router>, context: Arc<Context>, read_timeout: Duration) -> Self {
        let version = context.config.protocol_version_string();
        Self { router, context, version, read_timeout }
    }
}

impl HandlerFactory for HttpHandlerFactory {
    fn create(&self, peer: SocketAddr) -> Box<dyn ConnectionHandler> {
        Box::new(HttpHandler {
            peer,
            router: Arc::clone(&self.router),
            context: Arc::clone(&self.context),
            version: self.version.clone(),
            read_timeout: self.read_timeout,
        })
    }
}
