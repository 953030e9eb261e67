//! # Ciclo de Vida del Proceso
//! src/server/process.rs
//!
//! ```text
//! inicializando → { listo → sirviendo } | clean | run → { apagado | abortado }
//! ```
//!
//! - Modos clásicos (`fg`, `bg`): se abre el socket de escucha al
//!   construir el proceso, antes de cualquier otra I/O, y se sirve hasta
//!   la interrupción.
//! - Modos `clean` y `run`: nunca abren el socket ni entran al event loop;
//!   corren una única tarea de la aplicación y terminan.
//!
//! `shutdown` es el camino ordenado (solo después de servir). `abort` es
//! el camino de error: asume subsistemas a medio construir y revisa cada
//! uno antes de cerrarlo.

use std::backtrace::Backtrace;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::ValueEnum;
use tracing::{error, info};

use super::dispatch::Dispatcher;
use super::event_loop::{EventLoop, LoopExit};
use super::handler::HandlerFactory;
use super::listener;
use super::poller::MioPoller;
use crate::config::ServerConfig;
use crate::error::{report, BoxError, InitError, ServerError, ServerResult};
use crate::jobs::{NoopScheduler, Scheduler};
use crate::logging::Logging;
use crate::metrics::ServerStats;
use crate::workers::{PoolConfig, ThreadPool, WorkerPool};

/// Modo de ejecución del proceso
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Foreground: un solo thread, procesamiento inline
    Fg,
    /// Background: event loop + pool de workers
    Bg,
    /// Mantenimiento: limpieza y salida
    Clean,
    /// Ejecución única y salida
    Run,
}

impl Mode {
    /// Los modos clásicos sirven conexiones
    pub fn is_classic(self) -> bool {
        matches!(self, Mode::Fg | Mode::Bg)
    }

    pub fn is_single_threaded(self) -> bool {
        self == Mode::Fg
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Fg => "fg",
            Mode::Bg => "bg",
            Mode::Clean => "clean",
            Mode::Run => "run",
        }
    }
}

/// Estado del proceso
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Initializing,
    Ready,
    Serving,
    Clean,
    Run,
    ShutDown,
    Aborted,
}

/// Cómo terminó el proceso
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    ShutDown,
    Aborted,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::ShutDown => 0,
            ExitStatus::Aborted => 1,
        }
    }
}

/// Conexión a la base de datos de la aplicación
pub trait Database: Send + Sync {
    fn close(&self);
}

/// Lo que la aplicación recibe para construir sus piezas de servicio
pub struct ServeContext<'a, D> {
    pub config: &'a ServerConfig,
    pub mode: Mode,
    pub stats: &'a Arc<ServerStats>,
    pub pool: Option<&'a Arc<dyn WorkerPool>>,
    pub database: &'a Arc<D>,
}

/// Aplicación montada sobre el front-end
pub trait Application {
    type Db: Database + 'static;

    fn load_model(&mut self, config: &ServerConfig) -> Result<(), InitError>;

    fn open_database(&mut self, config: &ServerConfig) -> Result<Arc<Self::Db>, InitError>;

    /// Trabajos periódicos (solo modos clásicos)
    fn scheduler(&mut self, _ctx: &ServeContext<'_, Self::Db>) -> Result<Box<dyn Scheduler>, InitError> {
        Ok(Box::new(NoopScheduler))
    }

    fn handler_factory(&mut self, ctx: &ServeContext<'_, Self::Db>) -> Result<Arc<dyn HandlerFactory>, InitError>;

    /// Tarea del modo `clean`
    fn clean(&mut self, _database: &Self::Db) -> Result<(), BoxError> {
        Ok(())
    }

    /// Tarea del modo `run`
    fn run_once(&mut self, _database: &Self::Db) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Proceso servidor
pub struct ServerProcess<A: Application> {
    config: ServerConfig,
    mode: Mode,
    app: A,
    logging: Logging,
    listener: Option<TcpListener>,
    database: Option<Arc<A::Db>>,
    pool: Option<Arc<dyn WorkerPool>>,
    stats: Arc<ServerStats>,
    interrupt: Arc<AtomicBool>,
    state: ProcessState,
}

impl<A: Application> ServerProcess<A> {
    /// Valida la configuración y, en modos clásicos, abre el socket
    pub fn new(config: ServerConfig, mode: Mode, app: A, logging: Logging) -> ServerResult<Self> {
        config.validate()?;

        let listener = if mode.is_classic() { Some(listener::bind(&config)?) } else { None };

        Ok(Self {
            config,
            mode,
            app,
            logging,
            listener,
            database: None,
            pool: None,
            stats: Arc::new(ServerStats::new()),
            interrupt: Arc::new(AtomicBool::new(false)),
            state: ProcessState::Initializing,
        })
    }

    /// Dirección real del socket de escucha (si hay)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Flag que detiene el event loop; lo activan las señales
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn logging(&self) -> &Logging {
        &self.logging
    }

    /// Corre el proceso hasta el final
    pub fn run(&mut self) -> ExitStatus {
        info!(mode = self.mode.as_str(), "Iniciando proceso");

        if let Err(e) = self.initialize() {
            return self.abort_init(e);
        }

        match self.mode {
            Mode::Fg | Mode::Bg => self.serve(),
            Mode::Clean | Mode::Run => self.run_task(),
        }
    }

    /// Modelo y base de datos, en ese orden
    fn initialize(&mut self) -> Result<(), InitError> {
        self.state = ProcessState::Initializing;
        self.app.load_model(&self.config)?;
        self.database = Some(self.app.open_database(&self.config)?);
        Ok(())
    }

    /// Scheduler, pool (bg) y fábrica de handlers
    fn prepare_serving(&mut self) -> Result<(Box<dyn Scheduler>, Dispatcher), InitError> {
        let Some(database) = self.database.as_ref() else {
            return Err(InitError::Database("database not opened".to_string()));
        };

        if self.mode == Mode::Bg {
            let pool: Arc<dyn WorkerPool> = Arc::new(ThreadPool::new(PoolConfig::from_config(&self.config)));
            self.pool = Some(pool);
        }

        let ctx = ServeContext {
            config: &self.config,
            mode: self.mode,
            stats: &self.stats,
            pool: self.pool.as_ref(),
            database,
        };
        let scheduler = self.app.scheduler(&ctx)?;
        let factory = self.app.handler_factory(&ctx)?;

        let dispatcher = Dispatcher::new(
            factory,
            self.pool.clone(),
            self.mode.is_single_threaded(),
            Arc::clone(&self.stats),
            self.config.debug,
        );
        Ok((scheduler, dispatcher))
    }

    fn serve(&mut self) -> ExitStatus {
        let (mut scheduler, dispatcher) = match self.prepare_serving() {
            Ok(parts) => parts,
            Err(e) => return self.abort_init(e),
        };
        self.state = ProcessState::Ready;

        let poller = match MioPoller::new() {
            Ok(poller) => poller,
            Err(e) => return self.abort(Some(&ServerError::Io(e))),
        };
        let mut event_loop = EventLoop::new(poller, self.config.poll_timeout());

        let Some(listener) = self.listener.as_ref() else {
            return self.abort(None);
        };

        self.config.log_summary();
        info!(
            address = %self.config.address(),
            inline = dispatcher.is_inline(),
            "Sirviendo"
        );
        self.state = ProcessState::Serving;

        let result = event_loop.serve_forever(listener, &dispatcher, scheduler.as_mut(), &self.interrupt);
        drop(event_loop);

        match result {
            Ok(LoopExit::Interrupted) => self.shutdown("interrupción recibida"),
            Err(e) => self.abort(Some(&e)),
        }
    }

    fn run_task(&mut self) -> ExitStatus {
        let Some(database) = self.database.clone() else {
            return self.abort(None);
        };

        let result = if self.mode == Mode::Clean {
            self.state = ProcessState::Clean;
            self.app.clean(&database)
        } else {
            self.state = ProcessState::Run;
            self.app.run_once(&database)
        };

        if let Err(e) = result {
            return self.abort(Some(&ServerError::Task(e)));
        }

        info!(mode = self.mode.as_str(), "Tarea terminada");
        self.logging.close();
        if let Some(database) = self.database.take() {
            database.close();
        }
        self.state = ProcessState::ShutDown;
        ExitStatus::ShutDown
    }

    /// Apagado ordenado después de servir
    fn shutdown(&mut self, reason: &str) -> ExitStatus {
        self.listener.take();
        info!(reason, "Apagando servidor");

        if let Some(pool) = self.pool.take() {
            info!(status = %pool.status(), "Drenando pool de workers");
            pool.shutdown();
        }

        let stats = self.stats.snapshot();
        info!(
            accepted = stats.accepted_connections,
            requests = stats.requests_served,
            "Servidor detenido"
        );

        self.logging.close();
        if let Some(database) = self.database.take() {
            database.close();
        }
        self.state = ProcessState::ShutDown;
        ExitStatus::ShutDown
    }

    /// Los errores reconocidos van por `abort`; los inesperados se
    /// registran una sola vez, con la cadena completa y la traza
    fn abort_init(&mut self, e: InitError) -> ExitStatus {
        if e.is_recognized() {
            return self.abort(Some(&ServerError::Init(e)));
        }

        self.listener.take();
        error!(
            error = %report(&e),
            backtrace = %Backtrace::force_capture(),
            "Error inesperado durante la inicialización, abortando proceso"
        );
        self.release_aborted()
    }

    /// Terminación por error; el llamador sale con `ExitStatus::code()`
    fn abort(&mut self, error: Option<&ServerError>) -> ExitStatus {
        self.listener.take();

        match error {
            Some(e) => error!(error = %report(e), "Abortando proceso"),
            None => error!(backtrace = %Backtrace::force_capture(), "Abortando proceso"),
        }

        self.release_aborted()
    }

    fn release_aborted(&mut self) -> ExitStatus {
        self.logging.close();
        // Solo si llegó a construirse
        if let Some(database) = self.database.take() {
            database.close();
        }
        self.state = ProcessState::Aborted;
        ExitStatus::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handler::{ConnectionHandler, HandlerResult};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_subscriber::layer::{self, Layer, SubscriberExt};

    #[derive(Default)]
    struct CountingDb {
        closes: AtomicUsize,
    }

    impl Database for CountingDb {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FailAt {
        Nothing,
        Model,
        Database,
        Scheduler,
        Task,
    }

    struct CloseFactory;

    impl HandlerFactory for CloseFactory {
        fn create(&self, _peer: SocketAddr) -> Box<dyn ConnectionHandler> {
            Box::new(|_: &mut TcpStream| -> HandlerResult { Ok(true) })
        }
    }

    struct FakeApp {
        fail_at: FailAt,
        db: Arc<CountingDb>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl FakeApp {
        fn new(fail_at: FailAt) -> Self {
            Self { fail_at, db: Arc::new(CountingDb::default()), calls: Arc::new(Mutex::new(Vec::new())) }
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Application for FakeApp {
        type Db = CountingDb;

        fn load_model(&mut self, _config: &ServerConfig) -> Result<(), InitError> {
            self.record("model");
            match self.fail_at {
                FailAt::Model => Err(InitError::Model("routes missing".into())),
                _ => Ok(()),
            }
        }

        fn open_database(&mut self, _config: &ServerConfig) -> Result<Arc<CountingDb>, InitError> {
            self.record("database");
            match self.fail_at {
                FailAt::Database => Err(InitError::Database("locked".into())),
                _ => Ok(Arc::clone(&self.db)),
            }
        }

        fn scheduler(&mut self, _ctx: &ServeContext<'_, CountingDb>) -> Result<Box<dyn Scheduler>, InitError> {
            self.record("scheduler");
            match self.fail_at {
                FailAt::Scheduler => Err(InitError::Unexpected("scheduler exploded".into())),
                _ => Ok(Box::new(NoopScheduler)),
            }
        }

        fn handler_factory(&mut self, _ctx: &ServeContext<'_, CountingDb>) -> Result<Arc<dyn HandlerFactory>, InitError> {
            self.record("factory");
            Ok(Arc::new(CloseFactory))
        }

        fn clean(&mut self, _database: &CountingDb) -> Result<(), BoxError> {
            self.record("clean");
            match self.fail_at {
                FailAt::Task => Err("clean failed".into()),
                _ => Ok(()),
            }
        }

        fn run_once(&mut self, _database: &CountingDb) -> Result<(), BoxError> {
            self.record("run");
            match self.fail_at {
                FailAt::Task => Err("run failed".into()),
                _ => Ok(()),
            }
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
            poll_interval_ms: 10,
            ..ServerConfig::default()
        }
    }

    fn process(mode: Mode, fail_at: FailAt) -> (ServerProcess<FakeApp>, Arc<CountingDb>, Arc<Mutex<Vec<&'static str>>>) {
        let app = FakeApp::new(fail_at);
        let db = Arc::clone(&app.db);
        let calls = Arc::clone(&app.calls);
        let process = ServerProcess::new(test_config(), mode, app, Logging::detached()).unwrap();
        (process, db, calls)
    }

    // ==================== Abort vs shutdown ====================

    #[test]
    fn test_abort_before_database_never_closes_it() {
        let (mut process, db, _) = process(Mode::Fg, FailAt::Model);
        let status = process.run();

        assert_eq!(status, ExitStatus::Aborted);
        assert_eq!(status.code(), 1);
        assert_eq!(process.state(), ProcessState::Aborted);
        assert_eq!(db.closes.load(Ordering::SeqCst), 0);
        assert!(process.logging().is_closed());
        assert!(process.local_addr().is_none());
    }

    #[test]
    fn test_database_failure_aborts() {
        let (mut process, db, calls) = process(Mode::Bg, FailAt::Database);
        assert_eq!(process.run(), ExitStatus::Aborted);
        assert_eq!(db.closes.load(Ordering::SeqCst), 0);
        assert_eq!(*calls.lock().unwrap(), vec!["model", "database"]);
    }

    #[test]
    fn test_abort_after_database_closes_it_once() {
        let (mut process, db, calls) = process(Mode::Fg, FailAt::Scheduler);
        let status = process.run();

        assert_eq!(status, ExitStatus::Aborted);
        assert_eq!(process.state(), ProcessState::Aborted);
        assert_eq!(db.closes.load(Ordering::SeqCst), 1);
        assert!(!calls.lock().unwrap().contains(&"factory"));
    }

    /// Cuenta los eventos ERROR emitidos en el thread del test
    struct ErrorCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for ErrorCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: layer::Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::ERROR {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn errors_logged(process: &mut ServerProcess<FakeApp>) -> (ExitStatus, usize) {
        let errors = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(ErrorCounter(Arc::clone(&errors)));
        let status = tracing::subscriber::with_default(subscriber, || process.run());
        (status, errors.load(Ordering::SeqCst))
    }

    #[test]
    fn test_unexpected_init_error_logged_once() {
        let (mut process, db, _) = process(Mode::Fg, FailAt::Scheduler);
        let (status, errors) = errors_logged(&mut process);

        assert_eq!(status, ExitStatus::Aborted);
        assert_eq!(errors, 1);
        assert_eq!(db.closes.load(Ordering::SeqCst), 1);
        assert!(process.logging().is_closed());
        assert!(process.local_addr().is_none());
    }

    #[test]
    fn test_recognized_init_error_logged_once() {
        let (mut process, _, _) = process(Mode::Fg, FailAt::Model);
        let (status, errors) = errors_logged(&mut process);

        assert_eq!(status, ExitStatus::Aborted);
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_interrupt_shuts_down_gracefully() {
        let (mut process, db, calls) = process(Mode::Fg, FailAt::Nothing);
        assert!(process.local_addr().is_some());
        process.interrupt_handle().store(true, Ordering::SeqCst);

        let status = process.run();

        assert_eq!(status, ExitStatus::ShutDown);
        assert_eq!(status.code(), 0);
        assert_eq!(process.state(), ProcessState::ShutDown);
        assert_eq!(db.closes.load(Ordering::SeqCst), 1);
        assert!(process.logging().is_closed());
        assert!(process.local_addr().is_none());
        assert_eq!(*calls.lock().unwrap(), vec!["model", "database", "scheduler", "factory"]);
    }

    #[test]
    fn test_bg_mode_drains_pool_on_shutdown() {
        let (mut process, db, _) = process(Mode::Bg, FailAt::Nothing);
        let interrupt = process.interrupt_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            interrupt.store(true, Ordering::SeqCst);
        });

        assert_eq!(process.run(), ExitStatus::ShutDown);
        stopper.join().unwrap();
        assert_eq!(db.closes.load(Ordering::SeqCst), 1);
        assert!(process.stats().snapshot().loop_iterations >= 1);
    }

    // ==================== Modos ====================

    #[test]
    fn test_mode_classification() {
        assert!(Mode::Fg.is_classic());
        assert!(Mode::Bg.is_classic());
        assert!(!Mode::Clean.is_classic());
        assert!(!Mode::Run.is_classic());
        assert!(Mode::Fg.is_single_threaded());
        assert!(!Mode::Bg.is_single_threaded());
    }

    #[test]
    fn test_clean_mode_never_listens_or_serves() {
        let (mut process, db, calls) = process(Mode::Clean, FailAt::Nothing);
        assert!(process.local_addr().is_none());

        assert_eq!(process.run(), ExitStatus::ShutDown);
        assert_eq!(process.stats().snapshot().loop_iterations, 0);
        assert_eq!(db.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*calls.lock().unwrap(), vec!["model", "database", "clean"]);
    }

    #[test]
    fn test_run_mode_task_failure_aborts() {
        let (mut process, db, calls) = process(Mode::Run, FailAt::Task);
        assert!(process.local_addr().is_none());

        assert_eq!(process.run(), ExitStatus::Aborted);
        assert_eq!(db.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*calls.lock().unwrap(), vec!["model", "database", "run"]);
    }

    #[test]
    fn test_non_classic_mode_ignores_busy_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig { port: taken.local_addr().unwrap().port(), ..test_config() };
        let process = ServerProcess::new(config, Mode::Run, FakeApp::new(FailAt::Nothing), Logging::detached());
        assert!(process.is_ok());
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let config = ServerConfig { workers: 1, ..test_config() };
        let result = ServerProcess::new(config, Mode::Fg, FakeApp::new(FailAt::Nothing), Logging::detached());
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn test_busy_port_is_fatal_in_classic_mode() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig { port: taken.local_addr().unwrap().port(), ..test_config() };
        let result = ServerProcess::new(config, Mode::Bg, FakeApp::new(FailAt::Nothing), Logging::detached());
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }
}
