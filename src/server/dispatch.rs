//! # Política de Despacho
//! src/server/dispatch.rs
//!
//! Decide, para cada conexión legible, si se procesa inline en el thread
//! del loop (modo foreground o sin pool) o si se encola en el pool de
//! workers.
//!
//! El loop ya quitó la conexión del multiplexor antes de llegar aquí: el
//! `ConnectionState` se mueve al procesamiento y solo vuelve al loop si el
//! handler pidió keep-alive.
//!
//! ## Clasificación de errores
//!
//! | Error del handler           | Acción                               |
//! |-----------------------------|--------------------------------------|
//! | `ConnectionReset`           | log con puerto del cliente, cerrar   |
//! | `BrokenPipe`                | log con puerto del cliente, cerrar   |
//! | `NotConnected`              | cerrar en silencio                   |
//! | otro error de socket        | cerrar y propagar `ServerError`      |
//! | otro fallo (o panic)        | log con la cadena completa, cerrar   |

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use tracing::{debug, error, info, trace};

use super::connection::ConnectionState;
use super::handler::HandlerFactory;
use super::poller::Notify;
use crate::error::{report, HandlerError, ServerError, ServerResult, SocketFailure};
use crate::metrics::ServerStats;
use crate::workers::WorkerPool;

/// Canal de vuelta para conexiones keep-alive procesadas por workers
#[derive(Clone)]
pub struct KeepAlive {
    tx: Sender<ConnectionState>,
    notifier: Arc<dyn Notify>,
}

impl KeepAlive {
    pub fn new(tx: Sender<ConnectionState>, notifier: Arc<dyn Notify>) -> Self {
        Self { tx, notifier }
    }

    /// Devuelve la conexión al loop y lo despierta
    ///
    /// Si el loop ya no existe, la conexión se cierra al descartarse.
    pub fn hand_back(&self, conn: ConnectionState) {
        if let Err(returned) = self.tx.send(conn) {
            debug!(peer = %returned.0.peer(), "Event loop detenido, cerrando conexión keep-alive");
            return;
        }
        if let Err(e) = self.notifier.notify() {
            error!(error = %e, "No se pudo despertar al event loop");
        }
    }
}

/// Lo que necesita un despacho, compartible con los workers
#[derive(Clone)]
struct Processor {
    factory: Arc<dyn HandlerFactory>,
    stats: Arc<ServerStats>,
}

impl Processor {
    fn run(&self, conn: ConnectionState) -> ServerResult<Option<ConnectionState>> {
        process_connection(conn, self.factory.as_ref(), &self.stats)
    }
}

/// Política de despacho de conexiones legibles
pub struct Dispatcher {
    processor: Processor,
    pool: Option<Arc<dyn WorkerPool>>,
    single_threaded: bool,
    debug: u8,
}

impl Dispatcher {
    pub fn new(
        factory: Arc<dyn HandlerFactory>,
        pool: Option<Arc<dyn WorkerPool>>,
        single_threaded: bool,
        stats: Arc<ServerStats>,
        debug: u8,
    ) -> Self {
        Self {
            processor: Processor { factory, stats },
            pool,
            single_threaded,
            debug,
        }
    }

    pub fn debug(&self) -> u8 {
        self.debug
    }

    pub fn stats(&self) -> &ServerStats {
        &self.processor.stats
    }

    /// true si las conexiones se procesan en el thread del loop
    pub fn is_inline(&self) -> bool {
        self.pool.is_none() || self.single_threaded
    }

    /// Despacha una conexión ya quitada del multiplexor
    ///
    /// Inline devuelve la conexión si hay que re-registrarla. Con pool
    /// devuelve `None` enseguida; el worker la devuelve por `keep_alive`.
    pub fn on_readable(
        &self,
        mut conn: ConnectionState,
        keep_alive: &KeepAlive,
    ) -> ServerResult<Option<ConnectionState>> {
        conn.mark_dispatched();

        let pool = match &self.pool {
            Some(pool) if !self.single_threaded => pool,
            _ => return self.processor.run(conn),
        };

        if self.debug >= 2 {
            trace!(peer = %conn.peer(), "Encolando conexión en el pool");
        }
        let processor = self.processor.clone();
        let keep_alive = keep_alive.clone();
        pool.add_task(Box::new(move || {
            if let Some(conn) = processor.run(conn)? {
                keep_alive.hand_back(conn);
            }
            Ok(())
        }));
        Ok(None)
    }
}

/// Corre un handler sobre la conexión y clasifica el resultado
///
/// Devuelve `Some(conn)` si la conexión sigue viva (keep-alive). En todos
/// los demás casos la conexión ya está cerrada al volver.
pub fn process_connection(
    mut conn: ConnectionState,
    factory: &dyn HandlerFactory,
    stats: &ServerStats,
) -> ServerResult<Option<ConnectionState>> {
    let peer = conn.peer();
    let mut handler = factory.create(peer);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(conn.stream_mut())));

    let should_close = match outcome {
        Ok(Ok(should_close)) => {
            stats.record_request();
            should_close
        }
        Ok(Err(HandlerError::Io(e))) => {
            if let Err(e) = socket_failure(&conn, e) {
                stats.record_close();
                conn.close();
                return Err(e);
            }
            true
        }
        Ok(Err(e)) => {
            error!(peer = %peer, error = %report(&e), "Fallo del handler, cerrando conexión");
            true
        }
        Err(panic) => {
            error!(peer = %peer, panic = panic_message(panic.as_ref()), "Panic en el handler, cerrando conexión");
            true
        }
    };

    conn.finish_request(should_close);
    if conn.should_close() {
        stats.record_close();
        conn.close();
        Ok(None)
    } else {
        Ok(Some(conn))
    }
}

/// Registra un error de socket; `Err` si no se sabe recuperar
fn socket_failure(conn: &ConnectionState, err: io::Error) -> ServerResult<()> {
    match SocketFailure::classify(&err) {
        SocketFailure::PeerReset => {
            info!(port = conn.peer_port(), "Conexión reiniciada por el cliente");
            Ok(())
        }
        SocketFailure::BrokenPipe => {
            info!(port = conn.peer_port(), error = %err, "Broken pipe escribiendo al cliente");
            Ok(())
        }
        SocketFailure::Stale => Ok(()),
        SocketFailure::Unclassified => Err(ServerError::Socket { peer: conn.peer(), source: err }),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<sin mensaje>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler::{ConnectionHandler, HandlerResult};
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Fábrica que siempre devuelve el mismo comportamiento
    struct FnFactory<F>(F);

    impl<F> HandlerFactory for FnFactory<F>
    where
        F: Fn(&mut TcpStream) -> HandlerResult + Send + Sync + Clone + 'static,
    {
        fn create(&self, _peer: SocketAddr) -> Box<dyn ConnectionHandler> {
            Box::new(self.0.clone())
        }
    }

    struct NoopNotify(AtomicUsize);

    impl Notify for NoopNotify {
        fn notify(&self) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pair() -> (ConnectionState, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        (ConnectionState::accepted(stream, peer).unwrap(), client)
    }

    fn assert_closed(mut client: TcpStream) {
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).unwrap();
    }

    fn run_with(result: impl Fn() -> HandlerResult + Send + Sync + Clone + 'static) -> (ServerResult<Option<ConnectionState>>, TcpStream) {
        let (conn, client) = pair();
        let factory = FnFactory(move |_: &mut TcpStream| result());
        let stats = ServerStats::new();
        (process_connection(conn, &factory, &stats), client)
    }

    // ==================== Clasificación ====================

    #[test]
    fn test_keep_alive_returns_connection() {
        let (result, _client) = run_with(|| Ok(false));
        let conn = result.unwrap().expect("connection kept alive");
        assert_eq!(conn.served(), 1);
        assert!(!conn.should_close());
    }

    #[test]
    fn test_close_result_closes() {
        let (result, client) = run_with(|| Ok(true));
        assert!(result.unwrap().is_none());
        assert_closed(client);
    }

    #[test]
    fn test_peer_reset_closes() {
        let (result, client) = run_with(|| Err(io::Error::from(io::ErrorKind::ConnectionReset).into()));
        assert!(result.unwrap().is_none());
        assert_closed(client);
    }

    #[test]
    fn test_broken_pipe_closes() {
        let (result, client) = run_with(|| Err(io::Error::from(io::ErrorKind::BrokenPipe).into()));
        assert!(result.unwrap().is_none());
        assert_closed(client);
    }

    #[test]
    fn test_stale_socket_closes_silently() {
        let (result, client) = run_with(|| Err(io::Error::from(io::ErrorKind::NotConnected).into()));
        assert!(result.unwrap().is_none());
        assert_closed(client);
    }

    #[test]
    fn test_handler_failure_closes() {
        let (result, client) = run_with(|| Err(HandlerError::failure("bad request state")));
        assert!(result.unwrap().is_none());
        assert_closed(client);
    }

    #[test]
    fn test_handler_panic_closes() {
        let (result, client) = run_with(|| panic!("handler exploded"));
        assert!(result.unwrap().is_none());
        assert_closed(client);
    }

    #[test]
    fn test_unclassified_error_propagates() {
        let (result, client) = run_with(|| Err(io::Error::from(io::ErrorKind::PermissionDenied).into()));
        match result {
            Err(ServerError::Socket { source, .. }) => assert_eq!(source.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("expected socket error, got {:?}", other.map(|c| c.is_some())),
        }
        assert_closed(client);
    }

    // ==================== Despacho ====================

    fn echo_factory() -> Arc<dyn HandlerFactory> {
        Arc::new(FnFactory(|stream: &mut TcpStream| {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf)?;
            stream.write_all(&buf)?;
            Ok(false)
        }))
    }

    #[test]
    fn test_inline_without_pool() {
        let stats = Arc::new(ServerStats::new());
        let dispatcher = Dispatcher::new(echo_factory(), None, false, stats, 0);
        assert!(dispatcher.is_inline());

        let (tx, _rx) = mpsc::channel();
        let keep_alive = KeepAlive::new(tx, Arc::new(NoopNotify(AtomicUsize::new(0))));
        let (conn, mut client) = pair();
        client.write_all(b"ping").unwrap();

        let conn = dispatcher.on_readable(conn, &keep_alive).unwrap().expect("keep-alive");
        assert_eq!(conn.served(), 1);
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(dispatcher.stats().snapshot().requests_served, 1);
    }

    #[test]
    fn test_pool_hands_connection_back() {
        use crate::workers::{PoolConfig, ThreadPool};

        let pool: Arc<dyn WorkerPool> = Arc::new(ThreadPool::new(PoolConfig::default()));
        let stats = Arc::new(ServerStats::new());
        let dispatcher = Dispatcher::new(echo_factory(), Some(Arc::clone(&pool)), false, stats, 2);
        assert!(!dispatcher.is_inline());

        let notify = Arc::new(NoopNotify(AtomicUsize::new(0)));
        let (tx, rx) = mpsc::channel();
        let keep_alive = KeepAlive::new(tx, notify.clone());
        let (conn, mut client) = pair();
        client.write_all(b"pong").unwrap();

        assert!(dispatcher.on_readable(conn, &keep_alive).unwrap().is_none());
        let returned = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(returned.served(), 1);
        assert_eq!(notify.0.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn test_single_threaded_ignores_pool() {
        use crate::workers::{PoolConfig, ThreadPool};

        let pool: Arc<dyn WorkerPool> = Arc::new(ThreadPool::new(PoolConfig::default()));
        let dispatcher = Dispatcher::new(echo_factory(), Some(Arc::clone(&pool)), true, Arc::new(ServerStats::new()), 0);
        assert!(dispatcher.is_inline());
        pool.shutdown();
    }

    #[test]
    fn test_hand_back_without_loop_closes() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let keep_alive = KeepAlive::new(tx, Arc::new(NoopNotify(AtomicUsize::new(0))));
        let (conn, client) = pair();
        keep_alive.hand_back(conn);
        assert_closed(client);
    }
}
