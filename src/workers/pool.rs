//! # Pool de Threads
//! src/workers/pool.rs
//!
//! Pool de workers sobre una cola FIFO thread-safe (Mutex + Condvar).
//!
//! ## Política
//!
//! - Arranca con `workers` threads
//! - Un worker que sirvió `max_requests` tareas se retira y se reemplaza
//! - Si quedan menos de `spawn_under` workers libres, se crea uno más
//!   (nunca más de `MAX_GROWTH_FACTOR` veces el tamaño inicial)
//! - Cada `check_interval` tareas se revisan los workers ocupados:
//!   - ocupado más de `hung_threshold`: se reporta como colgado
//!   - ocupado más de `kill_threshold`: se da por muerto, se abandona su
//!     thread y se crea un reemplazo (un thread no se puede matar)
//!   - matado y todavía vivo tras `kill_grace`: zombie
//!   - más de `zombie_limit` zombies: el proceso se termina

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::{Task, WorkerPool};
use crate::config::ServerConfig;
use crate::error::report;

/// El pool nunca crece más allá de este múltiplo del tamaño inicial
const MAX_GROWTH_FACTOR: usize = 2;

/// Configuración del pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// 0 = sin límite
    pub max_requests: u64,
    pub hung_threshold: Duration,
    pub kill_threshold: Option<Duration>,
    pub kill_grace: Duration,
    pub spawn_under: usize,
    /// 0 = desactivado
    pub zombie_limit: usize,
    pub check_interval: u64,
}

impl PoolConfig {
    /// Crea una configuración desde el `ServerConfig` principal
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            workers: config.workers,
            max_requests: config.max_requests_per_worker,
            hung_threshold: Duration::from_secs(config.hung_threshold_secs),
            kill_threshold: match config.kill_threshold_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            kill_grace: Duration::from_secs(config.kill_grace_secs),
            spawn_under: config.spawn_under,
            zombie_limit: config.zombie_limit,
            check_interval: config.check_interval.max(1),
        }
    }

    fn max_workers(&self) -> usize {
        self.workers * MAX_GROWTH_FACTOR
    }

    /// Cuánto espera `shutdown` al trabajo en curso
    fn drain_timeout(&self) -> Duration {
        self.kill_threshold.unwrap_or(self.hung_threshold)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Estado visible del pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
    pub killed: usize,
    pub zombies: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retired: u64,
    pub accepting: bool,
}

/// Un worker vivo
struct WorkerSlot {
    busy_since: Option<Instant>,
    served: u64,
}

struct PoolState {
    queue: VecDeque<Task>,
    workers: HashMap<usize, WorkerSlot>,
    /// Workers dados por muertos -> instante en que se los mató
    killed: HashMap<usize, Instant>,
    next_id: usize,
    accepting: bool,
    submitted: u64,
    completed: u64,
    failed: u64,
    retired: u64,
}

impl PoolState {
    fn busy(&self) -> usize {
        self.workers.values().filter(|w| w.busy_since.is_some()).count()
    }

    fn idle(&self) -> usize {
        self.workers.len() - self.busy()
    }

    fn zombies(&self, now: Instant, grace: Duration) -> usize {
        self.killed.values().filter(|killed_at| now.duration_since(**killed_at) >= grace).count()
    }
}

type ZombieHook = Box<dyn Fn(usize) + Send + Sync>;

struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Hay tareas nuevas o el pool se está deteniendo
    available: Condvar,
    /// Un worker terminó (para `shutdown`)
    exited: Condvar,
    handles: Mutex<HashMap<usize, JoinHandle<()>>>,
    on_zombie_overflow: ZombieHook,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Las tareas corren fuera del lock: un panic no puede envenenarlo a medias
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Pool de workers basado en threads
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Crea el pool y arranca los workers iniciales
    ///
    /// Si se superan los zombies permitidos, el proceso termina con status 1.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_zombie_hook(config, |zombies| {
            error!(zombies, "Demasiados workers zombies, terminando el proceso");
            std::process::exit(1);
        })
    }

    /// Igual que `new` pero con una acción propia ante exceso de zombies
    pub fn with_zombie_hook(config: PoolConfig, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        let initial = config.workers;
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                workers: HashMap::new(),
                killed: HashMap::new(),
                next_id: 0,
                accepting: true,
                submitted: 0,
                completed: 0,
                failed: 0,
                retired: 0,
            }),
            available: Condvar::new(),
            exited: Condvar::new(),
            handles: Mutex::new(HashMap::new()),
            on_zombie_overflow: Box::new(hook),
        });

        {
            let mut state = shared.lock();
            for _ in 0..initial {
                spawn_worker(&shared, &mut state);
            }
        }

        info!(workers = initial, "Pool de workers iniciado");
        Self { shared }
    }

    /// Foto del estado del pool
    pub fn snapshot(&self) -> PoolStatus {
        let state = self.shared.lock();
        PoolStatus {
            workers: state.workers.len(),
            busy: state.busy(),
            queued: state.queue.len(),
            killed: state.killed.len(),
            zombies: state.zombies(Instant::now(), self.shared.config.kill_grace),
            submitted: state.submitted,
            completed: state.completed,
            failed: state.failed,
            retired: state.retired,
            accepting: state.accepting,
        }
    }

    /// Revisa workers colgados y zombies
    fn check_health(&self, state: &mut PoolState) {
        let config = &self.shared.config;
        let now = Instant::now();

        let mut to_kill = Vec::new();
        for (id, slot) in &state.workers {
            let Some(since) = slot.busy_since else { continue };
            let elapsed = now.duration_since(since);
            match config.kill_threshold {
                Some(kill) if elapsed >= kill => to_kill.push(*id),
                _ if elapsed >= config.hung_threshold => {
                    warn!(worker = id, busy_secs = elapsed.as_secs(), "Worker colgado");
                }
                _ => {}
            }
        }

        for id in to_kill {
            state.workers.remove(&id);
            state.killed.insert(id, now);
            // El thread queda abandonado; si algún día termina, sale solo
            if let Ok(mut handles) = self.shared.handles.lock() {
                handles.remove(&id);
            }
            warn!(worker = id, "Worker matado por exceder el umbral, creando reemplazo");
            if state.accepting {
                spawn_worker(&self.shared, state);
            }
        }

        let zombies = state.zombies(now, config.kill_grace);
        if zombies > 0 {
            warn!(zombies, "Workers matados que no desaparecieron");
        }
        if config.zombie_limit > 0 && zombies > config.zombie_limit {
            (self.shared.on_zombie_overflow)(zombies);
        }
    }
}

impl WorkerPool for ThreadPool {
    fn add_task(&self, task: Task) {
        let mut state = self.shared.lock();
        if !state.accepting {
            // La tarea se descarta; lo que capture se libera al soltarla
            warn!("Pool detenido, tarea descartada");
            return;
        }

        state.queue.push_back(task);
        state.submitted += 1;

        let free = state.idle().saturating_sub(state.queue.len());
        if free < self.shared.config.spawn_under && state.workers.len() < self.shared.config.max_workers() {
            debug!(free, workers = state.workers.len(), "Pocos workers libres, creando uno más");
            spawn_worker(&self.shared, &mut state);
        }

        self.shared.available.notify_one();

        if state.submitted % self.shared.config.check_interval == 0 {
            self.check_health(&mut state);
        }
    }

    fn shutdown(&self) {
        let deadline = Instant::now() + self.shared.config.drain_timeout();
        {
            let mut state = self.shared.lock();
            if !state.accepting {
                return;
            }
            state.accepting = false;
            self.shared.available.notify_all();
            info!(queued = state.queue.len(), busy = state.busy(), "Deteniendo pool de workers");

            while !state.workers.is_empty() {
                let now = Instant::now();
                if now >= deadline {
                    warn!(remaining = state.workers.len(), "Workers siguen ocupados, se abandonan");
                    break;
                }
                state = match self.shared.exited.wait_timeout(state, deadline - now) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
        }

        let handles: Vec<(usize, JoinHandle<()>)> = match self.shared.handles.lock() {
            Ok(mut handles) => handles.drain().collect(),
            Err(poisoned) => poisoned.into_inner().drain().collect(),
        };
        for (id, handle) in handles {
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!(worker = id, "Worker terminó con panic");
                }
            }
        }
        info!("Pool de workers detenido");
    }

    fn status(&self) -> String {
        let s = self.snapshot();
        format!(
            "workers: {} (busy {}, idle {}), queued: {}, killed: {}, zombies: {}, completed: {}, failed: {}, retired: {}",
            s.workers,
            s.busy,
            s.workers - s.busy,
            s.queued,
            s.killed,
            s.zombies,
            s.completed,
            s.failed,
            s.retired
        )
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Crea un worker nuevo; requiere el lock del estado
fn spawn_worker(shared: &Arc<Shared>, state: &mut PoolState) {
    let id = state.next_id;
    state.next_id += 1;

    let worker_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("worker-{}", id))
        .spawn(move || worker_loop(worker_shared, id));

    match spawned {
        Ok(handle) => {
            state.workers.insert(id, WorkerSlot { busy_since: None, served: 0 });
            if let Ok(mut handles) = shared.handles.lock() {
                handles.retain(|_, h| !h.is_finished());
                handles.insert(id, handle);
            }
        }
        Err(e) => error!(worker = id, error = %e, "No se pudo crear el worker"),
    }
}

/// Loop principal del worker
fn worker_loop(shared: Arc<Shared>, id: usize) {
    debug!(worker = id, "Worker iniciado");

    loop {
        let task = {
            let mut state = shared.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    if let Some(slot) = state.workers.get_mut(&id) {
                        slot.busy_since = Some(Instant::now());
                    }
                    break task;
                }
                if !state.accepting {
                    state.workers.remove(&id);
                    shared.exited.notify_all();
                    debug!(worker = id, "Worker terminado");
                    return;
                }
                state = match shared.available.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(task));

        let mut state = shared.lock();
        match outcome {
            Ok(Ok(())) => state.completed += 1,
            Ok(Err(e)) => {
                state.failed += 1;
                error!(worker = id, error = %report(e.as_ref()), "Tarea fallida");
            }
            Err(_) => {
                state.failed += 1;
                error!(worker = id, "Panic en tarea");
            }
        }

        // Si lo dieron por muerto mientras trabajaba, desaparece
        if state.killed.remove(&id).is_some() {
            info!(worker = id, "Worker matado terminó su tarea");
            return;
        }

        let Some(slot) = state.workers.get_mut(&id) else {
            return;
        };
        slot.busy_since = None;
        slot.served += 1;

        let max = shared.config.max_requests;
        if max > 0 && slot.served >= max {
            state.workers.remove(&id);
            state.retired += 1;
            debug!(worker = id, served = max, "Worker retirado");
            if state.accepting || !state.queue.is_empty() {
                spawn_worker(&shared, &mut state);
            }
            shared.exited.notify_all();
            return;
        }
    }
}
