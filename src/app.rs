//! # Aplicación por Defecto
//! src/app.rs
//!
//! `SiteApp` monta el sitio HTTP de `commands` sobre el front-end:
//!
//! - modelo: la tabla de rutas
//! - base de datos: `HitStore`, contadores de hits por ruta en memoria
//! - scheduler: un resumen periódico en el log
//! - `clean`: pone los contadores en cero
//! - `run`: registra un resumen y sale

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::info;

use crate::commands;
use crate::config::ServerConfig;
use crate::error::{BoxError, InitError};
use crate::http::HttpHandlerFactory;
use crate::jobs::{JobScheduler, Scheduler};
use crate::router::{Context, Router};
use crate::server::handler::HandlerFactory;
use crate::server::{Application, Database, ServeContext};

/// Hits por ruta
#[derive(Debug, Default)]
pub struct HitStore {
    hits: Mutex<HashMap<String, u64>>,
    closed: AtomicBool,
}

impl HitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.hits.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, path: &str) {
        *self.lock().entry(path.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, path: &str) -> u64 {
        self.lock().get(path).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.lock().values().sum()
    }

    /// Rutas ordenadas por hits (desc) y luego por path
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut hits: Vec<(String, u64)> = self.lock().iter().map(|(p, n)| (p.clone(), *n)).collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits
    }

    /// Borra todos los contadores; retorna cuántas rutas había
    pub fn reset(&self) -> usize {
        let mut hits = self.lock();
        let routes = hits.len();
        hits.clear();
        routes
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Database for HitStore {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let routes = self.lock().len();
            info!(routes, total = self.total(), "Base de hits cerrada");
        }
    }
}

/// Aplicación HTTP por defecto
pub struct SiteApp {
    router: Option<Arc<Router>>,
    summary_interval: Duration,
    read_timeout: Duration,
}

impl SiteApp {
    pub fn new(summary_interval: Duration, read_timeout: Duration) -> Self {
        Self { router: None, summary_interval, read_timeout }
    }

    fn log_summary(hits: &HitStore) {
        let top = hits.snapshot().into_iter().next();
        info!(
            total = hits.total(),
            top_route = top.as_ref().map(|(p, _)| p.as_str()).unwrap_or("-"),
            "Resumen de hits"
        );
    }
}

impl Default for SiteApp {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(5))
    }
}

impl Application for SiteApp {
    type Db = HitStore;

    fn load_model(&mut self, _config: &ServerConfig) -> Result<(), InitError> {
        let mut router = Router::new();
        commands::register_all(&mut router);
        if router.is_empty() {
            return Err(InitError::Model("no routes registered".to_string()));
        }
        info!(count = router.len(), routes = ?router.paths().collect::<Vec<_>>(), "Rutas cargadas");
        self.router = Some(Arc::new(router));
        Ok(())
    }

    fn open_database(&mut self, _config: &ServerConfig) -> Result<Arc<HitStore>, InitError> {
        Ok(Arc::new(HitStore::new()))
    }

    fn scheduler(&mut self, ctx: &ServeContext<'_, HitStore>) -> Result<Box<dyn Scheduler>, InitError> {
        let hits = Arc::clone(ctx.database);
        let mut scheduler = JobScheduler::new();
        scheduler.every("hit-summary", self.summary_interval, move || {
            Self::log_summary(&hits);
            Ok(())
        });
        Ok(Box::new(scheduler))
    }

    fn handler_factory(&mut self, ctx: &ServeContext<'_, HitStore>) -> Result<Arc<dyn HandlerFactory>, InitError> {
        let router = self
            .router
            .clone()
            .ok_or_else(|| InitError::Model("routes not loaded".to_string()))?;

        let context = Context {
            config: ctx.config.clone(),
            mode: ctx.mode,
            stats: Arc::clone(ctx.stats),
            pool: ctx.pool.cloned(),
            hits: Arc::clone(ctx.database),
        };
        Ok(Arc::new(HttpHandlerFactory::new(router, Arc::new(context), self.read_timeout)))
    }

    fn clean(&mut self, database: &HitStore) -> Result<(), BoxError> {
        let routes = database.reset();
        info!(routes, "Contadores de hits reiniciados");
        Ok(())
    }

    fn run_once(&mut self, database: &HitStore) -> Result<(), BoxError> {
        Self::log_summary(database);
        Ok(())
    }
}
