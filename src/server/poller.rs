//! # Multiplexor de Readiness
//! src/server/poller.rs
//!
//! Interfaz mínima sobre el mecanismo de readiness del sistema operativo.
//! El event loop solo conoce este trait, así los tests pueden sustituirlo
//! por un multiplexor falso y determinista.
//!
//! La implementación real usa `mio`, que elige el mejor mecanismo de la
//! plataforma (epoll en Linux, kqueue en BSD/macOS).

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Waker};

pub use mio::Token;

/// Token reservado para el socket de escucha
pub const LISTENER: Token = Token(0);

/// Token reservado para despertar el loop desde otros threads
pub const WAKER: Token = Token(usize::MAX);

/// Máximo de eventos por iteración
const MAX_EVENTS: usize = 1024;

/// Un evento de readiness reportado por el multiplexor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    /// El otro extremo cerró o hubo error en el socket
    pub hangup: bool,
}

impl Readiness {
    pub fn readable(token: Token) -> Self {
        Self { token, readable: true, hangup: false }
    }
}

/// Despierta al loop que está bloqueado en `wait`
pub trait Notify: Send + Sync {
    fn notify(&self) -> io::Result<()>;
}

impl Notify for Waker {
    fn notify(&self) -> io::Result<()> {
        self.wake()
    }
}

/// Interfaz del multiplexor de readiness
///
/// Solo se usa interés de lectura, pero se mantiene explícito en la firma.
pub trait Multiplexer {
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Re-arma un registro existente (necesario con notificación edge-triggered)
    fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Bloquea hasta `timeout` y deja en `ready` los eventos recibidos
    fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Duration) -> io::Result<()>;

    /// Handle para despertar el loop desde workers
    fn notifier(&self) -> Arc<dyn Notify>;
}

/// Multiplexor real basado en `mio::Poll`
pub struct MioPoller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl MioPoller {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            waker,
        })
    }
}

impl Multiplexer for MioPoller {
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(&mut SourceFd(&fd), token, interest)
    }

    fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(&mut SourceFd(&fd), token, interest)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Duration) -> io::Result<()> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        ready.extend(self.events.iter().map(|event| Readiness {
            token: event.token(),
            readable: event.is_readable(),
            hangup: event.is_read_closed() || event.is_error(),
        }));
        Ok(())
    }

    fn notifier(&self) -> Arc<dyn Notify> {
        self.waker.clone()
    }
}
