//! Bounded worker pools.
//!
//! A pool is a bounded FIFO queue plus an elastic set of worker threads.
//! Workers are spawned on demand up to `max_pool_size` and exit after
//! `max_worker_idle_secs` without work. Pools are process-wide singletons
//! keyed by name, like groups.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::core::error::CommandError;
use crate::events;
use crate::metrics::RollingCounter;

/// Work item a pool can execute. Implemented by task internals.
pub(crate) trait Runnable: Send + Sync {
    /// Process-unique id, used to dequeue on cancellation.
    fn task_id(&self) -> u64;
    /// Execute on a worker. The task records its own outcome.
    fn exec(&self);
    /// Complete the task as canceled without running it (shutdown path).
    fn abort(&self, error: CommandError);
}

struct QueuedTask {
    id: u64,
    runnable: Arc<dyn Runnable>,
}

struct PoolState {
    shutdown: bool,
    queue: VecDeque<QueuedTask>,
    workers: usize,
}

/// Rolling throughput counters for one pool.
pub struct PoolMetrics {
    /// Tasks accepted into the queue.
    pub enqueued: RollingCounter,
    /// Tasks a worker finished executing.
    pub executed: RollingCounter,
}

const METRICS_WINDOW: Duration = Duration::from_secs(60);
const METRICS_BUCKETS: usize = 12;

struct PoolInner {
    name: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Wakes idle workers on enqueue and shutdown; also signals worker
    /// exits to blocking shutdown.
    signal: Condvar,
    running: AtomicUsize,
    worker_seq: AtomicUsize,
    metrics: PoolMetrics,
}

/// A named, bounded work queue with an elastic worker set. Cheap to
/// clone; all clones share the singleton state.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Pool name.
    pub name: String,
    /// Tasks waiting in the queue.
    pub queued_tasks: usize,
    /// Remaining queue capacity.
    pub queue_space: usize,
    /// Live worker threads.
    pub worker_count: usize,
    /// Tasks executing right now.
    pub running_tasks: usize,
    /// Whether the pool has been shut down.
    pub shutdown: bool,
    /// Enqueue rate over the metrics window, events per second.
    pub enqueue_rate: f64,
    /// Execution rate over the metrics window, events per second.
    pub execute_rate: f64,
}

static POOLS: OnceLock<Mutex<HashMap<String, Pool>>> = OnceLock::new();

fn pools() -> &'static Mutex<HashMap<String, Pool>> {
    POOLS.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Pool {
    /// Look up or create the singleton pool `name` with default
    /// configuration.
    pub fn named(name: &str) -> Pool {
        let mut map = pools().lock();
        if let Some(existing) = map.get(name) {
            return existing.clone();
        }
        let pool = Self::build(name, PoolConfig::default());
        map.insert(name.to_string(), pool.clone());
        pool
    }

    /// Look up or create the singleton pool `name`. The configuration
    /// applies only when this call creates the pool (first writer wins).
    pub fn with_config(name: &str, config: PoolConfig) -> Result<Pool, CommandError> {
        config.validate().map_err(CommandError::Setup)?;
        let mut map = pools().lock();
        if let Some(existing) = map.get(name) {
            return Ok(existing.clone());
        }
        let pool = Self::build(name, config);
        map.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    fn build(name: &str, config: PoolConfig) -> Pool {
        info!(
            pool = name,
            max_queue_size = config.max_queue_size,
            max_pool_size = config.max_pool_size,
            max_worker_idle_secs = config.max_worker_idle_secs,
            "pool created"
        );
        Pool {
            inner: Arc::new(PoolInner {
                name: name.to_string(),
                config,
                state: Mutex::new(PoolState {
                    shutdown: false,
                    queue: VecDeque::new(),
                    workers: 0,
                }),
                signal: Condvar::new(),
                running: AtomicUsize::new(0),
                worker_seq: AtomicUsize::new(0),
                metrics: PoolMetrics {
                    enqueued: RollingCounter::new(METRICS_WINDOW, METRICS_BUCKETS),
                    executed: RollingCounter::new(METRICS_WINDOW, METRICS_BUCKETS),
                },
            }),
        }
    }

    /// The pool's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Number of tasks waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Number of free slots in the queue.
    pub fn queue_space(&self) -> usize {
        let queued = self.inner.state.lock().queue.len();
        self.inner.config.max_queue_size.saturating_sub(queued)
    }

    /// Whether the pool has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Rolling throughput counters.
    pub fn metrics(&self) -> &PoolMetrics {
        &self.inner.metrics
    }

    /// Point-in-time snapshot of queue, worker, and throughput counters.
    pub fn stats(&self) -> PoolStats {
        let (queued, workers, shutdown) = {
            let state = self.inner.state.lock();
            (state.queue.len(), state.workers, state.shutdown)
        };
        PoolStats {
            name: self.inner.name.clone(),
            queued_tasks: queued,
            queue_space: self.inner.config.max_queue_size.saturating_sub(queued),
            worker_count: workers,
            running_tasks: self.inner.running.load(Ordering::Acquire),
            shutdown,
            enqueue_rate: self.inner.metrics.enqueued.rate(),
            execute_rate: self.inner.metrics.executed.rate(),
        }
    }

    /// Append a task to the queue, growing the worker set if below the
    /// cap, and signal one waiting worker.
    pub(crate) fn enqueue(&self, runnable: Arc<dyn Runnable>) -> Result<(), CommandError> {
        let id = runnable.task_id();
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                drop(state);
                events::emit(
                    "pool.rejected",
                    json!({ "pool": self.inner.name, "task": id, "reason": "closed" }),
                );
                return Err(CommandError::PoolClosed(self.inner.name.clone()));
            }
            if state.queue.len() >= self.inner.config.max_queue_size {
                drop(state);
                warn!(pool = %self.inner.name, task = id, "queue full, rejecting task");
                events::emit(
                    "pool.rejected",
                    json!({ "pool": self.inner.name, "task": id, "reason": "queue full" }),
                );
                return Err(CommandError::QueueFull(self.inner.name.clone()));
            }
            state.queue.push_back(QueuedTask { id, runnable });
            if state.workers < self.inner.config.max_pool_size {
                state.workers += 1;
                self.spawn_worker();
            }
            self.inner.signal.notify_one();
        }
        self.inner.metrics.enqueued.increment(1);
        debug!(pool = %self.inner.name, task = id, "task enqueued");
        events::emit(
            "pool.enqueued",
            json!({ "pool": self.inner.name, "task": id }),
        );
        Ok(())
    }

    /// Remove a task from the queue if still present; no-op otherwise.
    /// Used by cancellation.
    pub(crate) fn dequeue(&self, task_id: u64) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.queue.len();
        state.queue.retain(|task| task.id != task_id);
        state.queue.len() != before
    }

    fn spawn_worker(&self) {
        let seq = self.inner.worker_seq.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("{}-worker-{seq}", self.inner.name))
            .spawn(move || worker_loop(&inner))
            .expect("failed to spawn pool worker");
    }

    /// Shut the pool down: no new tasks are accepted, idle workers are
    /// woken to exit, and tasks still queued complete as canceled so their
    /// waiters do not hang. With `block`, waits until every worker exited.
    pub fn shutdown(&self, block: bool) {
        let orphans: Vec<QueuedTask> = {
            let mut state = self.inner.state.lock();
            if !state.shutdown {
                state.shutdown = true;
                info!(pool = %self.inner.name, "pool shutting down");
            }
            self.inner.signal.notify_all();
            state.queue.drain(..).collect()
        };
        for task in &orphans {
            task.runnable
                .abort(CommandError::PoolClosed(self.inner.name.clone()));
        }
        if block {
            let mut state = self.inner.state.lock();
            while state.workers > 0 {
                self.inner.signal.wait(&mut state);
            }
        }
        events::emit("pool.shutdown", json!({ "pool": self.inner.name }));
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("queued", &state.queue.len())
            .field("workers", &state.workers)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// Shut down every registered pool. The explicit replacement for a
/// process-exit hook.
pub fn shutdown_all(block: bool) {
    let all: Vec<Pool> = pools().lock().values().cloned().collect();
    for pool in all {
        pool.shutdown(block);
    }
}

fn worker_loop(inner: &Arc<PoolInner>) {
    let idle = inner.config.max_worker_idle();
    debug!(pool = %inner.name, "worker started");
    loop {
        let task = {
            let mut state = inner.state.lock();
            if state.shutdown {
                break;
            }
            if state.queue.is_empty() {
                let _ = inner.signal.wait_for(&mut state, idle);
                if state.shutdown || state.queue.is_empty() {
                    break;
                }
            }
            match state.queue.pop_front() {
                Some(task) => task,
                None => break,
            }
        };
        inner.running.fetch_add(1, Ordering::AcqRel);
        // The task records its own outcome; a panic must not take the
        // worker down with it.
        let outcome = catch_unwind(AssertUnwindSafe(|| task.runnable.exec()));
        inner.running.fetch_sub(1, Ordering::AcqRel);
        inner.metrics.executed.increment(1);
        if outcome.is_err() {
            warn!(pool = %inner.name, task = task.id, "task execution panicked");
        }
    }
    // Self-removal happens under the queue lock; the notification doubles
    // as the wake-up for blocking shutdown.
    let mut state = inner.state.lock();
    state.workers = state.workers.saturating_sub(1);
    inner.signal.notify_all();
    debug!(pool = %inner.name, "worker exiting");
}
