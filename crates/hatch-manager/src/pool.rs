use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use hatch_runtime::{GuestCall, GuestOutcome};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::ManagerError;
use crate::metrics::ManagerMetrics;
use crate::worker::{RuntimeWorker, WorkerSpawner, WorkerState};

const RESTART_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// A fixed set of workers serving one application instance.
///
/// Dispatch picks workers round-robin among those able to take a request
/// and waits when every worker is busy. A worker found dead is replaced in
/// the background; only the request it was running fails.
pub struct WorkerPool {
    label: String,
    size: usize,
    spawner: Arc<dyn WorkerSpawner>,
    workers: RwLock<Vec<Arc<dyn RuntimeWorker>>>,
    next: AtomicUsize,
    available: Notify,
    in_flight: AtomicUsize,
    idle: Notify,
    accepting: AtomicBool,
    restarting: Mutex<HashSet<usize>>,
    spawned: AtomicU64,
    shutdown_timeout: Duration,
    metrics: Arc<ManagerMetrics>,
}

/// Counts a dispatch from before the acceptance check until it returns.
struct InFlight<'a> {
    pool: &'a WorkerPool,
}

impl<'a> InFlight<'a> {
    fn enter(pool: &'a WorkerPool) -> Self {
        pool.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { pool }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.pool.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.pool.idle.notify_waiters();
        }
    }
}

/// A worker claimed for one dispatch. Released on drop, even when the
/// dispatch is cancelled.
struct Reservation<'a> {
    pool: &'a Arc<WorkerPool>,
    index: usize,
    worker: Arc<dyn RuntimeWorker>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.worker.release();
        self.pool.available.notify_one();
        if self.worker.state() == WorkerState::Dead {
            self.pool.schedule_restart(self.index);
        }
    }
}

impl WorkerPool {
    pub fn new(
        label: impl Into<String>,
        size: usize,
        spawner: Arc<dyn WorkerSpawner>,
        metrics: Arc<ManagerMetrics>,
    ) -> Self {
        Self {
            label: label.into(),
            size: size.max(1),
            spawner,
            workers: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            available: Notify::new(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            accepting: AtomicBool::new(true),
            restarting: Mutex::new(HashSet::new()),
            spawned: AtomicU64::new(0),
            shutdown_timeout: Duration::from_secs(30),
            metrics,
        }
    }

    /// Bound on how long each worker gets to stop before it is forced.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.read_workers().iter().map(|w| w.state()).collect()
    }

    fn read_workers(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn RuntimeWorker>>> {
        self.workers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_workers(&self) -> RwLockWriteGuard<'_, Vec<Arc<dyn RuntimeWorker>>> {
        self.workers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn next_worker_id(&self) -> String {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        format!("{}#{n}", self.label)
    }

    /// Spawn every worker. If any fails, the ones already started are shut
    /// down and the first error is returned.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let mut spawns = JoinSet::new();
        for _ in 0..self.size {
            let spawner = Arc::clone(&self.spawner);
            let id = self.next_worker_id();
            spawns.spawn(async move { spawner.spawn(id).await });
        }

        let mut started = Vec::with_capacity(self.size);
        let mut failure = None;
        while let Some(joined) = spawns.join_next().await {
            match joined {
                Ok(Ok(worker)) => started.push(worker),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(join) => {
                    failure.get_or_insert(ManagerError::WorkerFailure {
                        worker: self.label.clone(),
                        reason: join.to_string(),
                    });
                }
            }
        }

        if let Some(e) = failure {
            tracing::error!(pool = %self.label, "Worker pool failed to start: {e}");
            shutdown_all(started, self.shutdown_timeout).await;
            return Err(e);
        }

        tracing::info!(pool = %self.label, workers = started.len(), "Worker pool started");
        *self.write_workers() = started;
        self.available.notify_waiters();
        Ok(())
    }

    /// Run one call on the next available worker.
    pub async fn dispatch(self: &Arc<Self>, call: GuestCall) -> Result<GuestOutcome, ManagerError> {
        let _flight = InFlight::enter(self);
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ManagerError::ShuttingDown);
        }
        let reservation = self.acquire().await?;
        tracing::debug!(pool = %self.label, worker = reservation.worker.id(), "Dispatching");
        reservation.worker.dispatch(call).await
    }

    async fn acquire(self: &Arc<Self>) -> Result<Reservation<'_>, ManagerError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.accepting.load(Ordering::SeqCst) {
                return Err(ManagerError::ShuttingDown);
            }

            let mut dead = Vec::new();
            let mut live = 0;
            let claimed = {
                let workers = self.read_workers();
                if workers.is_empty() {
                    return Err(ManagerError::Unavailable(format!(
                        "pool {} has no workers",
                        self.label
                    )));
                }
                let count = workers.len();
                let start = self.next.fetch_add(1, Ordering::Relaxed);
                let mut claimed = None;
                for offset in 0..count {
                    let index = (start + offset) % count;
                    let worker = &workers[index];
                    if worker.state() == WorkerState::Dead {
                        dead.push(index);
                        continue;
                    }
                    live += 1;
                    if worker.try_reserve() {
                        claimed = Some((index, Arc::clone(worker)));
                        break;
                    }
                }
                claimed
            };

            for index in dead {
                self.schedule_restart(index);
            }
            if let Some((index, worker)) = claimed {
                return Ok(Reservation {
                    pool: self,
                    index,
                    worker,
                });
            }
            if live == 0 {
                return Err(ManagerError::WorkerFailure {
                    worker: self.label.clone(),
                    reason: "no live workers".into(),
                });
            }

            notified.await;
        }
    }

    fn schedule_restart(self: &Arc<Self>, index: usize) {
        if !self.accepting.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut restarting = self.restarting.lock().unwrap_or_else(|e| e.into_inner());
            if !restarting.insert(index) {
                return;
            }
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(pool = %self.label, index, "No runtime to restart worker on");
            return;
        };
        let pool = Arc::clone(self);
        runtime.spawn(async move { pool.restart(index).await });
    }

    async fn restart(self: Arc<Self>, index: usize) {
        let mut backoff = RESTART_BACKOFF_MIN;
        while self.accepting.load(Ordering::SeqCst) {
            let id = self.next_worker_id();
            match self.spawner.spawn(id.clone()).await {
                Ok(worker) => {
                    match self.install(index, Arc::clone(&worker)) {
                        Some(old) => {
                            self.metrics.record_worker_restart();
                            tracing::info!(pool = %self.label, replaced = old.id(), worker = %id, "Worker restarted");
                            self.available.notify_waiters();
                            old.shutdown(self.shutdown_timeout).await;
                        }
                        None => worker.shutdown(self.shutdown_timeout).await,
                    }
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        pool = %self.label,
                        backoff_ms = backoff.as_millis() as u64,
                        "Worker restart failed: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
                }
            }
        }
        self.restarting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&index);
    }

    /// Put a replacement into slot `index`, returning the worker it replaced.
    /// `None` once the pool has stopped accepting.
    fn install(&self, index: usize, worker: Arc<dyn RuntimeWorker>) -> Option<Arc<dyn RuntimeWorker>> {
        let mut workers = self.write_workers();
        if !self.accepting.load(Ordering::SeqCst) || index >= workers.len() {
            return None;
        }
        Some(std::mem::replace(&mut workers[index], worker))
    }

    /// Wait for in-flight dispatches to finish. `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    /// Stop accepting, drain up to `drain_timeout`, then stop every worker.
    /// Later calls return immediately.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        self.available.notify_waiters();
        if !self.drain(drain_timeout).await {
            tracing::warn!(
                pool = %self.label,
                in_flight = self.in_flight(),
                "Drain timed out; stopping workers with requests in flight"
            );
        }
        let workers = std::mem::take(&mut *self.write_workers());
        shutdown_all(workers, self.shutdown_timeout).await;
        tracing::info!(pool = %self.label, "Worker pool stopped");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

async fn shutdown_all(workers: Vec<Arc<dyn RuntimeWorker>>, timeout: Duration) {
    let mut stops = JoinSet::new();
    for worker in workers {
        stops.spawn(async move { worker.shutdown(timeout).await });
    }
    while stops.join_next().await.is_some() {}
}
