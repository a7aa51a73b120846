use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Trait for metrics backends. Implementations can forward to Prometheus,
/// StatsD, or simply log metrics.
pub trait MetricsBackend: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_gauge(&self, name: &str, value: f64);
    fn record_histogram(&self, name: &str, value: f64);
}

/// In-memory metrics collector with atomic counters.
/// Shared by every application a manager serves.
pub struct ManagerMetrics {
    pub dispatches: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub entries_built: AtomicU64,
    pub entries_retired: AtomicU64,
    pub reloads: AtomicU64,
    pub reload_failures: AtomicU64,
    pub worker_restarts: AtomicU64,
    pub startup_failures: AtomicU64,
    backend: Option<Arc<dyn MetricsBackend>>,
}

impl std::fmt::Debug for ManagerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerMetrics")
            .field("dispatches", &self.dispatches)
            .field("dispatch_failures", &self.dispatch_failures)
            .field("cache_hits", &self.cache_hits)
            .field("cache_misses", &self.cache_misses)
            .field("entries_built", &self.entries_built)
            .field("entries_retired", &self.entries_retired)
            .field("reloads", &self.reloads)
            .field("reload_failures", &self.reload_failures)
            .field("worker_restarts", &self.worker_restarts)
            .field("startup_failures", &self.startup_failures)
            .finish()
    }
}

impl Default for ManagerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerMetrics {
    pub fn new() -> Self {
        Self {
            dispatches: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            entries_built: AtomicU64::new(0),
            entries_retired: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            reload_failures: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
            startup_failures: AtomicU64::new(0),
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    fn bump(&self, counter: &AtomicU64, name: &str) {
        let val = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter(name, val);
        }
    }

    pub fn record_dispatch(&self) {
        self.bump(&self.dispatches, "hatch.manager.dispatches");
    }

    pub fn record_dispatch_completed(&self, elapsed: Duration) {
        if let Some(backend) = &self.backend {
            backend.record_histogram("hatch.manager.dispatch_ms", elapsed.as_secs_f64() * 1000.0);
        }
    }

    pub fn record_dispatch_failure(&self) {
        self.bump(&self.dispatch_failures, "hatch.manager.dispatch_failures");
    }

    pub fn record_cache_hit(&self) {
        self.bump(&self.cache_hits, "hatch.manager.cache_hits");
    }

    pub fn record_cache_miss(&self) {
        self.bump(&self.cache_misses, "hatch.manager.cache_misses");
    }

    pub fn record_entry_built(&self) {
        self.bump(&self.entries_built, "hatch.manager.entries_built");
    }

    pub fn record_entry_retired(&self) {
        self.bump(&self.entries_retired, "hatch.manager.entries_retired");
    }

    pub fn record_live_entries(&self, app: &str, live: usize) {
        if let Some(backend) = &self.backend {
            backend.record_gauge(&format!("hatch.manager.live_entries.{app}"), live as f64);
        }
    }

    pub fn record_reload(&self) {
        self.bump(&self.reloads, "hatch.manager.reloads");
    }

    pub fn record_reload_failure(&self) {
        self.bump(&self.reload_failures, "hatch.manager.reload_failures");
    }

    pub fn record_worker_restart(&self) {
        self.bump(&self.worker_restarts, "hatch.manager.worker_restarts");
    }

    pub fn record_startup_failure(&self) {
        self.bump(&self.startup_failures, "hatch.manager.startup_failures");
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            entries_built: self.entries_built.load(Ordering::Relaxed),
            entries_retired: self.entries_retired.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            reload_failures: self.reload_failures.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            startup_failures: self.startup_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of manager metrics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub dispatches: u64,
    pub dispatch_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub entries_built: u64,
    pub entries_retired: u64,
    pub reloads: u64,
    pub reload_failures: u64,
    pub worker_restarts: u64,
    pub startup_failures: u64,
}

/// Logging-based metrics backend. Emits metrics as structured log events.
pub struct LoggingMetricsBackend;

impl MetricsBackend for LoggingMetricsBackend {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::info!(metric = name, value = value, kind = "counter", "metric");
    }

    fn record_gauge(&self, name: &str, value: f64) {
        tracing::info!(metric = name, value = value, kind = "gauge", "metric");
    }

    fn record_histogram(&self, name: &str, value: f64) {
        tracing::info!(metric = name, value = value, kind = "histogram", "metric");
    }
}
