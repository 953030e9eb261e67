//! # Event Loop
//! src/server/event_loop.rs
//!
//! Un solo thread espera readiness sobre el socket de escucha y sobre todas
//! las conexiones registradas, y despacha cada evento:
//!
//! - listener legible → aceptar exactamente una conexión y registrarla
//! - conexión legible → quitarla del multiplexor y despacharla
//! - waker → hay conexiones keep-alive devueltas por workers
//!
//! Después de los eventos de cada iteración (aunque no haya ninguno) se
//! re-registran las conexiones devueltas y se llama al scheduler.
//!
//! La tabla de registros solo la toca el thread del loop. Una conexión que
//! está en la tabla no la tiene nadie más; al despacharse sale de la tabla.

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use mio::Interest;
use tracing::{debug, info, trace, warn};

use super::connection::ConnectionState;
use super::dispatch::{Dispatcher, KeepAlive};
use super::poller::{Multiplexer, Readiness, Token, LISTENER, WAKER};
use crate::error::ServerResult;
use crate::jobs::Scheduler;

/// Entrada de la tabla de registros
#[derive(Debug)]
pub enum Registration {
    Listener,
    Connection(ConnectionState),
}

/// Por qué terminó `serve_forever`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Se recibió la señal de interrupción
    Interrupted,
}

/// Event loop sobre un multiplexor
pub struct EventLoop<M: Multiplexer> {
    poller: M,
    registrations: HashMap<Token, Registration>,
    next_token: usize,
    poll_timeout: Duration,
    keep_alive: KeepAlive,
    returned: Receiver<ConnectionState>,
    ready: Vec<Readiness>,
}

impl<M: Multiplexer> EventLoop<M> {
    pub fn new(poller: M, poll_timeout: Duration) -> Self {
        let (tx, returned) = mpsc::channel();
        let keep_alive = KeepAlive::new(tx, poller.notifier());
        Self {
            poller,
            registrations: HashMap::new(),
            next_token: 1,
            poll_timeout,
            keep_alive,
            returned,
            ready: Vec::new(),
        }
    }

    /// Conexiones registradas, sin contar el listener
    pub fn registered(&self) -> usize {
        self.registrations
            .values()
            .filter(|r| matches!(r, Registration::Connection(_)))
            .count()
    }

    /// Sirve hasta que `interrupt` se active
    ///
    /// Los errores que el despacho no contiene (socket no clasificado en
    /// modo inline, fallo del multiplexor) salen de aquí.
    pub fn serve_forever(
        &mut self,
        listener: &TcpListener,
        dispatcher: &Dispatcher,
        scheduler: &mut dyn Scheduler,
        interrupt: &AtomicBool,
    ) -> ServerResult<LoopExit> {
        self.poller.register(listener.as_raw_fd(), LISTENER, Interest::READABLE)?;
        self.registrations.insert(LISTENER, Registration::Listener);
        info!(timeout_ms = self.poll_timeout.as_millis() as u64, "Event loop iniciado");

        let result = self.run(listener, dispatcher, scheduler, interrupt);
        self.teardown(listener);
        result
    }

    fn run(
        &mut self,
        listener: &TcpListener,
        dispatcher: &Dispatcher,
        scheduler: &mut dyn Scheduler,
        interrupt: &AtomicBool,
    ) -> ServerResult<LoopExit> {
        loop {
            let stats = dispatcher.stats();
            stats.set_registered(self.registered());
            stats.record_iteration();

            self.ready.clear();
            match self.poller.wait(&mut self.ready, self.poll_timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if interrupt.load(Ordering::SeqCst) {
                        return Ok(LoopExit::Interrupted);
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            if interrupt.load(Ordering::SeqCst) {
                return Ok(LoopExit::Interrupted);
            }

            if dispatcher.debug() >= 2 && !self.ready.is_empty() {
                trace!(events = self.ready.len(), "Eventos de readiness");
            }

            let ready = std::mem::take(&mut self.ready);
            let outcome = self.handle_events(&ready, listener, dispatcher);
            self.ready = ready;
            outcome?;

            self.drain_returned();
            scheduler.poll();
        }
    }

    fn handle_events(&mut self, ready: &[Readiness], listener: &TcpListener, dispatcher: &Dispatcher) -> ServerResult<()> {
        for event in ready {
            match event.token {
                LISTENER => self.on_accept(listener, dispatcher)?,
                WAKER => self.drain_returned(),
                token if event.readable || event.hangup => self.on_readable(token, dispatcher)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Acepta una conexión pendiente y la registra
    fn on_accept(&mut self, listener: &TcpListener, dispatcher: &Dispatcher) -> ServerResult<()> {
        let accepted = listener.accept();
        // Notificación edge-triggered: re-armar para ver las que siguen pendientes
        self.poller.reregister(listener.as_raw_fd(), LISTENER, Interest::READABLE)?;

        match accepted {
            Ok((stream, peer)) => {
                dispatcher.stats().record_accept();
                if dispatcher.debug() >= 2 {
                    debug!(peer = %peer, "Conexión aceptada");
                }
                match ConnectionState::accepted(stream, peer) {
                    Ok(conn) => self.register(conn),
                    Err(e) => warn!(peer = %peer, error = %e, "No se pudo preparar la conexión"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "Error al aceptar conexión"),
        }
        Ok(())
    }

    /// Saca la conexión del multiplexor y la despacha
    fn on_readable(&mut self, token: Token, dispatcher: &Dispatcher) -> ServerResult<()> {
        let conn = match self.registrations.remove(&token) {
            Some(Registration::Connection(conn)) => conn,
            Some(other) => {
                self.registrations.insert(token, other);
                return Ok(());
            }
            // Evento viejo de una conexión ya despachada
            None => return Ok(()),
        };

        if let Err(e) = self.poller.deregister(conn.as_raw_fd()) {
            debug!(peer = %conn.peer(), error = %e, "Error al quitar la conexión del multiplexor");
        }

        if let Some(conn) = dispatcher.on_readable(conn, &self.keep_alive)? {
            self.register(conn);
        }
        Ok(())
    }

    /// Registra una conexión para lectura
    ///
    /// Si el multiplexor la rechaza, la conexión se cierra.
    fn register(&mut self, mut conn: ConnectionState) {
        let token = self.allocate_token();
        if let Err(e) = self.poller.register(conn.as_raw_fd(), token, Interest::READABLE) {
            warn!(peer = %conn.peer(), error = %e, "No se pudo registrar la conexión, cerrando");
            conn.close();
            return;
        }
        conn.mark_registered(token);
        self.registrations.insert(token, Registration::Connection(conn));
    }

    /// Re-registra las conexiones keep-alive devueltas por workers
    fn drain_returned(&mut self) {
        while let Ok(conn) = self.returned.try_recv() {
            self.register(conn);
        }
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = self.next_token.wrapping_add(1);
            if token != LISTENER && token != WAKER && !self.registrations.contains_key(&token) {
                return token;
            }
        }
    }

    /// Deja el multiplexor vacío y cierra las conexiones que quedaron
    fn teardown(&mut self, listener: &TcpListener) {
        let _ = self.poller.deregister(listener.as_raw_fd());
        let mut closed = 0;
        for (_, registration) in self.registrations.drain() {
            if let Registration::Connection(conn) = registration {
                let _ = self.poller.deregister(conn.as_raw_fd());
                conn.close();
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(closed, "Conexiones registradas cerradas al salir del loop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HandlerError, ServerError};
    use crate::metrics::ServerStats;
    use crate::server::handler::{ConnectionHandler, HandlerFactory, HandlerResult};
    use crate::server::poller::{MioPoller, Notify};
    use std::io::Read;
    use std::net::{SocketAddr, TcpStream};
    use std::os::fd::RawFd;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    // ==================== Multiplexor falso ====================

    #[derive(Default)]
    struct FakeState {
        registered: HashMap<RawFd, Token>,
        registrations: Vec<RawFd>,
        deregistrations: Vec<RawFd>,
        waits: usize,
    }

    struct NullNotify;

    impl Notify for NullNotify {
        fn notify(&self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Reporta legibles el listener y todas las conexiones registradas.
    /// Tras `rounds` esperas activa la interrupción.
    struct FakePoller {
        state: Arc<Mutex<FakeState>>,
        interrupt: Arc<AtomicBool>,
        rounds: usize,
        eintr_on: Option<usize>,
    }

    impl Multiplexer for FakePoller {
        fn register(&mut self, fd: RawFd, token: Token, _interest: Interest) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.registered.insert(fd, token);
            if token != LISTENER {
                state.registrations.push(fd);
            }
            Ok(())
        }

        fn reregister(&mut self, fd: RawFd, token: Token, _interest: Interest) -> io::Result<()> {
            self.state.lock().unwrap().registered.insert(fd, token);
            Ok(())
        }

        fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.registered.remove(&fd).is_some_and(|t| t != LISTENER) {
                state.deregistrations.push(fd);
            }
            Ok(())
        }

        fn wait(&mut self, ready: &mut Vec<Readiness>, _timeout: Duration) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.waits += 1;
            if Some(state.waits) == self.eintr_on {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            if state.waits > self.rounds {
                self.interrupt.store(true, Ordering::SeqCst);
                return Ok(());
            }
            ready.push(Readiness::readable(LISTENER));
            let mut tokens: Vec<Token> = state.registered.values().copied().filter(|t| *t != LISTENER).collect();
            tokens.sort();
            ready.extend(tokens.into_iter().map(Readiness::readable));
            Ok(())
        }

        fn notifier(&self) -> Arc<dyn Notify> {
            Arc::new(NullNotify)
        }
    }

    /// Fábrica que registra cada llamada y verifica exclusión mutua
    struct ScriptedFactory {
        state: Arc<Mutex<FakeState>>,
        calls: Arc<AtomicUsize>,
        violations: Arc<AtomicUsize>,
        script: Vec<fn() -> HandlerResult>,
    }

    impl HandlerFactory for ScriptedFactory {
        fn create(&self, _peer: SocketAddr) -> Box<dyn ConnectionHandler> {
            let state = Arc::clone(&self.state);
            let calls = Arc::clone(&self.calls);
            let violations = Arc::clone(&self.violations);
            let script = self.script.clone();
            Box::new(move |stream: &mut TcpStream| {
                if state.lock().unwrap().registered.contains_key(&stream.as_raw_fd()) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                let n = calls.fetch_add(1, Ordering::SeqCst);
                script.get(n).map_or(Ok(true), |step| step())
            })
        }
    }

    struct Harness {
        state: Arc<Mutex<FakeState>>,
        interrupt: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
        violations: Arc<AtomicUsize>,
        listener: TcpListener,
        event_loop: EventLoop<FakePoller>,
        dispatcher: Dispatcher,
    }

    fn harness(rounds: usize, script: Vec<fn() -> HandlerResult>) -> Harness {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let interrupt = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();

        let poller = FakePoller { state: Arc::clone(&state), interrupt: Arc::clone(&interrupt), rounds, eintr_on: None };
        let factory = ScriptedFactory {
            state: Arc::clone(&state),
            calls: Arc::clone(&calls),
            violations: Arc::clone(&violations),
            script,
        };
        let dispatcher = Dispatcher::new(Arc::new(factory), None, true, Arc::new(ServerStats::new()), 2);

        Harness {
            state,
            interrupt,
            calls,
            violations,
            listener,
            event_loop: EventLoop::new(poller, Duration::from_millis(10)),
            dispatcher,
        }
    }

    impl Harness {
        fn connect(&self) -> TcpStream {
            TcpStream::connect(self.listener.local_addr().unwrap()).unwrap()
        }

        fn serve(&mut self) -> ServerResult<LoopExit> {
            let mut scheduler = || {};
            self.event_loop.serve_forever(&self.listener, &self.dispatcher, &mut scheduler, &self.interrupt)
        }
    }

    fn assert_eof(mut client: TcpStream) {
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).unwrap(), 0);
    }

    // ==================== Propiedades del loop ====================

    #[test]
    fn test_keep_alive_round_trip() {
        let mut h = harness(5, vec![|| Ok(false), || Ok(true)]);
        let client = h.connect();

        assert_eq!(h.serve().unwrap(), LoopExit::Interrupted);

        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.violations.load(Ordering::SeqCst), 0);
        let state = h.state.lock().unwrap();
        // registro inicial + re-registro tras el keep-alive
        assert_eq!(state.registrations.len(), 2);
        assert_eq!(state.deregistrations.len(), 2);
        assert!(state.registered.is_empty());
        drop(state);
        assert_eof(client);
    }

    #[test]
    fn test_unregister_precedes_dispatch() {
        let mut h = harness(8, vec![|| Ok(false), || Ok(false), || Ok(false), || Ok(false)]);
        let _a = h.connect();
        let _b = h.connect();

        h.serve().unwrap();

        assert!(h.calls.load(Ordering::SeqCst) >= 4);
        assert_eq!(h.violations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_error_containment() {
        let mut h = harness(
            12,
            vec![
                || Err(io::Error::from(io::ErrorKind::ConnectionReset).into()),
                || Err(io::Error::from(io::ErrorKind::BrokenPipe).into()),
                || Err(io::Error::from(io::ErrorKind::NotConnected).into()),
                || Err(HandlerError::failure("corrupt request")),
                || Ok(true),
            ],
        );
        let clients: Vec<TcpStream> = (0..5).map(|_| h.connect()).collect();

        assert_eq!(h.serve().unwrap(), LoopExit::Interrupted);

        assert_eq!(h.calls.load(Ordering::SeqCst), 5);
        assert_eq!(h.event_loop.registered(), 0);
        assert_eq!(h.dispatcher.stats().snapshot().accepted_connections, 5);
        assert_eq!(h.dispatcher.stats().snapshot().closed_connections, 5);
        for client in clients {
            assert_eof(client);
        }
    }

    #[test]
    fn test_unclassified_error_escapes_loop() {
        let mut h = harness(5, vec![|| Err(io::Error::from(io::ErrorKind::PermissionDenied).into())]);
        let client = h.connect();

        assert!(matches!(h.serve(), Err(ServerError::Socket { .. })));
        assert_eof(client);
    }

    #[test]
    fn test_eintr_without_flag_is_ignored() {
        let mut h = harness(3, vec![]);
        h.event_loop.poller.eintr_on = Some(1);

        assert_eq!(h.serve().unwrap(), LoopExit::Interrupted);
        assert_eq!(h.state.lock().unwrap().waits, 4);
    }

    #[test]
    fn test_scheduler_polled_every_iteration_without_connections() {
        let mut h = harness(10, vec![]);
        let mut polls = 0usize;
        {
            let mut scheduler = || polls += 1;
            h.event_loop
                .serve_forever(&h.listener, &h.dispatcher, &mut scheduler, &h.interrupt)
                .unwrap();
        }
        assert_eq!(polls, 10);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_registered_count_published() {
        let mut h = harness(3, vec![|| Ok(false), || Ok(false)]);
        let _client = h.connect();
        h.serve().unwrap();
        assert_eq!(h.dispatcher.stats().registered(), 1);
        // al salir del loop no queda nada registrado
        assert_eq!(h.event_loop.registered(), 0);
    }

    // ==================== Multiplexor real ====================

    #[test]
    fn test_scheduler_ticks_with_real_poller() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let factory = ScriptedFactory {
            state: Arc::new(Mutex::new(FakeState::default())),
            calls: Arc::new(AtomicUsize::new(0)),
            violations: Arc::new(AtomicUsize::new(0)),
            script: vec![],
        };
        let dispatcher = Dispatcher::new(Arc::new(factory), None, true, Arc::new(ServerStats::new()), 0);
        let interval = Duration::from_millis(20);
        let mut event_loop = EventLoop::new(MioPoller::new().unwrap(), interval);

        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupt);
        let started = Instant::now();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            flag.store(true, Ordering::SeqCst);
        });

        let mut polls = 0u128;
        {
            let mut scheduler = || polls += 1;
            event_loop.serve_forever(&listener, &dispatcher, &mut scheduler, &interrupt).unwrap();
        }
        stopper.join().unwrap();

        // Al menos un poll por intervalo transcurrido, con un tick de tolerancia
        let elapsed = started.elapsed().as_millis();
        assert!(polls + 1 >= elapsed / interval.as_millis(), "polls = {}, elapsed = {}", polls, elapsed);
        assert!(polls <= elapsed / interval.as_millis() + 1, "polls = {}, elapsed = {}", polls, elapsed);
    }

    #[test]
    fn test_real_poller_keeps_accepting_backlog() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let factory = ScriptedFactory {
            state: Arc::new(Mutex::new(FakeState::default())),
            calls: Arc::new(AtomicUsize::new(0)),
            violations: Arc::new(AtomicUsize::new(0)),
            script: vec![],
        };
        let stats = Arc::new(ServerStats::new());
        let dispatcher = Dispatcher::new(Arc::new(factory), None, true, Arc::clone(&stats), 0);
        let mut event_loop = EventLoop::new(MioPoller::new().unwrap(), Duration::from_millis(10));

        let clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();

        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupt);
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            flag.store(true, Ordering::SeqCst);
        });
        let mut scheduler = || {};
        event_loop.serve_forever(&listener, &dispatcher, &mut scheduler, &interrupt).unwrap();
        stopper.join().unwrap();

        assert_eq!(stats.snapshot().accepted_connections, 3);
        drop(clients);
    }
}
