//! Application cache: every live [`AppInstance`] of one registered
//! application, keyed by [`CacheKey`].
//!
//! Static applications are a cache with one key. Dynamic applications get a
//! key per resolved target. Lookups take the table lock shared; a miss takes
//! it exclusively and checks again, so concurrent first requests for a key
//! build one instance between them.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use hatch_core::{ApplicationSpec, CacheKey, ManagerConfig};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::autoreload::{AutoreloadHandle, ReloadTarget, Subscription};
use crate::error::ManagerError;
use crate::instance::{AppHealth, AppInstance, InstanceState};
use crate::metrics::ManagerMetrics;
use crate::pool::WorkerPool;
use crate::worker::process::ProcessSpawner;
use crate::worker::thread::{MutationGuard, ThreadSlotSpawner};
use crate::worker::{Backend, WorkerSettings, WorkerSpawner};

/// Where to report source changes for a cache's entries.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub handle: AutoreloadHandle,
    pub extensions: Vec<String>,
    pub debounce: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub dynamic: bool,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub drain_timeout: Duration,
    pub grace_period: Duration,
    /// Live entries kept before the least recently used idle one is evicted.
    pub max_entries: Option<usize>,
    pub watch: Option<WatchSettings>,
}

impl CacheSettings {
    pub fn from_config(config: &ManagerConfig, dynamic: bool) -> Self {
        Self {
            dynamic,
            startup_timeout: config.startup_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            drain_timeout: config.drain_timeout(),
            grace_period: config.grace_period(),
            max_entries: if dynamic {
                config.max_dynamic_entries
            } else {
                None
            },
            watch: None,
        }
    }

    pub fn with_watch(mut self, watch: Option<WatchSettings>) -> Self {
        self.watch = watch;
        self
    }
}

/// One cached instance and the bookkeeping that decides when it may stop.
pub struct AppCacheEntry {
    key: CacheKey,
    origin: PathBuf,
    instance: Arc<AppInstance>,
    ref_count: AtomicUsize,
    released: Notify,
    evicting: AtomicBool,
    created_at: Instant,
    last_used: Mutex<Instant>,
}

impl AppCacheEntry {
    fn new(key: CacheKey, instance: Arc<AppInstance>) -> Self {
        let now = Instant::now();
        Self {
            key,
            origin: instance.spec().origin(),
            instance,
            ref_count: AtomicUsize::new(0),
            released: Notify::new(),
            evicting: AtomicBool::new(false),
            created_at: now,
            last_used: Mutex::new(now),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Directory the entry's modules were loaded from.
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn instance(&self) -> &Arc<AppInstance> {
        &self.instance
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_evicting(&self) -> bool {
        self.evicting.load(Ordering::Acquire)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lease(self: &Arc<Self>) -> EntryLease {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        EntryLease {
            entry: Arc::clone(self),
        }
    }

    async fn wait_released(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.ref_count() == 0 {
                return;
            }
            released.await;
        }
    }
}

/// A counted reference to a cache entry, held for the length of one request.
pub struct EntryLease {
    entry: Arc<AppCacheEntry>,
}

impl EntryLease {
    pub fn entry(&self) -> &Arc<AppCacheEntry> {
        &self.entry
    }
}

impl Deref for EntryLease {
    type Target = AppCacheEntry;

    fn deref(&self) -> &AppCacheEntry {
        &self.entry
    }
}

impl Drop for EntryLease {
    fn drop(&mut self) {
        if self.entry.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.entry.released.notify_waiters();
        }
    }
}

pub struct AppCache {
    name: String,
    backend: Backend,
    settings: CacheSettings,
    table: RwLock<HashMap<CacheKey, Arc<AppCacheEntry>>>,
    rebuild: tokio::sync::Mutex<()>,
    retiring: Mutex<Vec<Arc<AppCacheEntry>>>,
    closed: AtomicBool,
    metrics: Arc<ManagerMetrics>,
    this: Weak<AppCache>,
}

impl AppCache {
    pub fn new(
        name: impl Into<String>,
        backend: Backend,
        settings: CacheSettings,
        metrics: Arc<ManagerMetrics>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|this| Self {
            name,
            backend,
            settings,
            table: RwLock::new(HashMap::new()),
            rebuild: tokio::sync::Mutex::new(()),
            retiring: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            metrics,
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.is_empty()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Arc<AppCacheEntry>> {
        self.table.read().await.get(key).cloned()
    }

    pub async fn entries(&self) -> Vec<Arc<AppCacheEntry>> {
        self.table.read().await.values().cloned().collect()
    }

    /// Return the live entry for `key`, building it with `build_spec` on a
    /// miss. `build_spec` runs at most once per key no matter how many
    /// callers miss at the same time.
    pub async fn resolve<F>(&self, key: CacheKey, build_spec: F) -> Result<EntryLease, ManagerError>
    where
        F: FnOnce() -> Result<ApplicationSpec, ManagerError>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ManagerError::ShuttingDown);
        }

        {
            let table = self.table.read().await;
            if let Some(entry) = table.get(&key) {
                self.metrics.record_cache_hit();
                return Ok(entry.lease());
            }
        }

        // Slot before table: waiting out in-flight guest calls must not hold
        // the table, or hits on other keys would queue behind this build.
        let slot = self.mutation_slot().await;
        let mut table = self.table.write().await;
        if let Some(entry) = table.get(&key) {
            self.metrics.record_cache_hit();
            return Ok(entry.lease());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ManagerError::ShuttingDown);
        }
        self.metrics.record_cache_miss();

        let spec = build_spec()?;
        let entry = self.construct(key.clone(), spec, slot.as_ref()).await?;
        drop(slot);

        if let Some(max) = self.settings.max_entries
            && table.len() >= max
        {
            self.evict_idle(&mut table);
        }
        table.insert(key.clone(), Arc::clone(&entry));
        self.metrics.record_live_entries(&self.name, table.len());
        let lease = entry.lease();
        drop(table);

        tracing::info!(
            app = %self.name,
            key = %key.short_id(),
            entry = %key.entry(),
            origin = %entry.origin.display(),
            "Application entry built"
        );
        self.subscribe(&entry);
        start_in_background(&entry);
        Ok(lease)
    }

    /// The shared runtime's mutation slot, for thread-backed caches.
    ///
    /// Lock order is slot, then table. A queued slot request also holds back
    /// later thread-model dispatches until the guest calls running now end,
    /// so a long streaming response delays both.
    async fn mutation_slot(&self) -> Option<MutationGuard<'_>> {
        match &self.backend {
            Backend::Thread(shared) => Some(shared.mutate().await),
            Backend::Process(_) => None,
        }
    }

    /// Build an instance for `spec`. A thread-backed load needs the mutation
    /// slot; pass it in when the caller already holds it.
    async fn construct(
        &self,
        key: CacheKey,
        spec: ApplicationSpec,
        slot: Option<&MutationGuard<'_>>,
    ) -> Result<Arc<AppCacheEntry>, ManagerError> {
        let label = if self.settings.dynamic {
            format!("{}[{}]", self.name, key.short_id())
        } else {
            self.name.clone()
        };
        let settings = WorkerSettings::for_spec(
            &spec,
            self.settings.startup_timeout,
            self.settings.shutdown_timeout,
        );

        let spawner: Arc<dyn WorkerSpawner> = match &self.backend {
            Backend::Thread(shared) => {
                let loaded = match slot {
                    Some(slot) => slot.load_module(&spec).await,
                    None => shared.mutate().await.load_module(&spec).await,
                };
                let callable = loaded.map_err(|e| ManagerError::StartupFailure {
                    app: label.clone(),
                    reason: e.to_string(),
                })?;
                Arc::new(ThreadSlotSpawner::new(Arc::clone(shared), callable, settings))
            }
            Backend::Process(launcher) => Arc::new(ProcessSpawner::new(
                Arc::clone(launcher),
                spec.clone(),
                settings,
            )),
        };

        let pool = WorkerPool::new(label.clone(), spec.workers, spawner, Arc::clone(&self.metrics))
            .with_shutdown_timeout(self.settings.shutdown_timeout);
        let instance = AppInstance::new(label, spec, Arc::new(pool), Arc::clone(&self.metrics));
        self.metrics.record_entry_built();
        Ok(Arc::new(AppCacheEntry::new(key, Arc::new(instance))))
    }

    /// Drop the least recently used entry nobody holds. Over capacity is
    /// allowed when every entry is in use.
    fn evict_idle(&self, table: &mut HashMap<CacheKey, Arc<AppCacheEntry>>) {
        let victim = table
            .values()
            .filter(|entry| entry.ref_count() == 0)
            .min_by_key(|entry| entry.last_used())
            .map(|entry| entry.key.clone());
        match victim.and_then(|key| table.remove(&key)) {
            Some(entry) => {
                tracing::info!(app = %self.name, key = %entry.key.short_id(), "Evicting least recently used entry");
                self.unsubscribe(&entry);
                self.retire(entry);
            }
            None => {
                tracing::warn!(app = %self.name, live = table.len(), "Cache over capacity; every entry is in use");
            }
        }
    }

    /// Remove `key` now and stop its instance once released and past the
    /// grace period.
    pub async fn evict(&self, key: &CacheKey) -> bool {
        let removed = {
            let mut table = self.table.write().await;
            let removed = table.remove(key);
            self.metrics.record_live_entries(&self.name, table.len());
            removed
        };
        match removed {
            Some(entry) => {
                self.unsubscribe(&entry);
                self.retire(entry);
                true
            }
            None => false,
        }
    }

    fn retire(&self, entry: Arc<AppCacheEntry>) {
        entry.evicting.store(true, Ordering::Release);
        self.retiring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&entry));

        let grace = self.settings.grace_period;
        let drain = self.settings.drain_timeout;
        let metrics = Arc::clone(&self.metrics);
        let cache = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            entry.wait_released().await;
            entry.instance.shutdown(drain).await;
            metrics.record_entry_retired();
            tracing::info!(
                app = entry.instance.label(),
                lived_ms = entry.created_at.elapsed().as_millis() as u64,
                "Retired application entry"
            );
            if let Some(cache) = cache.upgrade() {
                cache
                    .retiring
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|other| !Arc::ptr_eq(other, &entry));
            }
        });
    }

    /// Entries replaced or evicted but not yet stopped.
    pub fn retiring(&self) -> usize {
        self.retiring.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn subscribe(&self, entry: &AppCacheEntry) {
        let Some(watch) = &self.settings.watch else {
            return;
        };
        let target: Weak<dyn ReloadTarget> = self.this.clone();
        watch.handle.subscribe(
            Subscription {
                target: self.name.clone(),
                directory: entry.origin.clone(),
                key: entry.key.clone(),
                extensions: watch.extensions.clone(),
                debounce: watch.debounce,
            },
            target,
        );
    }

    fn unsubscribe(&self, entry: &AppCacheEntry) {
        if let Some(watch) = &self.settings.watch {
            watch.handle.unsubscribe(&self.name, &entry.origin, &entry.key);
        }
    }

    /// Rebuild every entry loaded from under `dir`.
    ///
    /// Modules from `dir` are purged and re-imported while holding the
    /// mutation slot. A rebuilt entry replaces the old one in the table and
    /// the old one retires. An entry that fails to rebuild stays in place
    /// but is marked failed.
    pub async fn rebuild_directory(&self, dir: &Path) -> Result<usize, ManagerError> {
        let _rebuild = self.rebuild.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ManagerError::ShuttingDown);
        }
        if !self.table.read().await.values().any(|entry| entry.origin.starts_with(dir)) {
            return Ok(0);
        }

        let slot = self.mutation_slot().await;
        let mut table = self.table.write().await;
        let affected: Vec<Arc<AppCacheEntry>> = table
            .values()
            .filter(|entry| entry.origin.starts_with(dir))
            .cloned()
            .collect();
        if affected.is_empty() {
            return Ok(0);
        }
        if let Some(slot) = &slot {
            let purged = slot.evict_modules(dir).await;
            tracing::debug!(app = %self.name, dir = %dir.display(), purged, "Purged modules");
        }

        let mut rebuilt = 0;
        let mut failure = None;
        for old in affected {
            let spec = old.instance.spec().clone();
            match self.construct(old.key.clone(), spec, slot.as_ref()).await {
                Ok(entry) => {
                    table.insert(old.key.clone(), Arc::clone(&entry));
                    self.metrics.record_reload();
                    tracing::info!(app = %self.name, key = %old.key.short_id(), "Reloaded application entry");
                    start_in_background(&entry);
                    self.retire(old);
                    rebuilt += 1;
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.metrics.record_reload_failure();
                    tracing::error!(
                        app = %self.name,
                        key = %old.key.short_id(),
                        dir = %dir.display(),
                        "Reload failed: {reason}"
                    );
                    old.instance.mark_failed(format!("reload failed: {reason}"));
                    failure.get_or_insert(ManagerError::ReloadFailure {
                        key: old.key.to_string(),
                        reason,
                    });
                }
            }
        }
        drop(slot);
        drop(table);

        match failure {
            Some(e) => Err(e),
            None => Ok(rebuilt),
        }
    }

    /// Rebuild every live entry.
    pub async fn reload_all(&self) -> Result<usize, ManagerError> {
        let mut origins: Vec<PathBuf> = self
            .table
            .read()
            .await
            .values()
            .map(|entry| entry.origin.clone())
            .collect();
        origins.sort();
        origins.dedup();

        let mut rebuilt = 0;
        let mut failure = None;
        for origin in origins {
            match self.rebuild_directory(&origin).await {
                Ok(n) => rebuilt += n,
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(rebuilt),
        }
    }

    /// Readiness across every live entry. An empty dynamic cache is ready.
    pub async fn health(&self) -> AppHealth {
        if self.closed.load(Ordering::SeqCst) {
            return AppHealth::Stopped;
        }
        let table = self.table.read().await;
        if table.is_empty() {
            return if self.settings.dynamic {
                AppHealth::Ready
            } else {
                AppHealth::Starting
            };
        }
        let mut health = AppHealth::Ready;
        for entry in table.values() {
            match entry.instance.health() {
                failed @ AppHealth::Failed(_) => return failed,
                AppHealth::Starting => health = AppHealth::Starting,
                AppHealth::Stopped => return AppHealth::Stopped,
                AppHealth::Ready => {}
            }
        }
        health
    }

    /// Stop every entry, live or retiring, without waiting out grace periods.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _rebuild = self.rebuild.lock().await;
        let live: Vec<Arc<AppCacheEntry>> = self.table.write().await.drain().map(|(_, e)| e).collect();
        let retiring = std::mem::take(&mut *self.retiring.lock().unwrap_or_else(|e| e.into_inner()));

        let mut stops = JoinSet::new();
        for entry in live.iter().chain(retiring.iter()) {
            self.unsubscribe(entry);
            entry.evicting.store(true, Ordering::Release);
            let instance = Arc::clone(&entry.instance);
            let drain = self.settings.drain_timeout;
            stops.spawn(async move { instance.shutdown(drain).await });
        }
        while stops.join_next().await.is_some() {}
        self.metrics.record_live_entries(&self.name, 0);
        tracing::info!(app = %self.name, entries = live.len(), "Application cache stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn start_in_background(entry: &AppCacheEntry) {
    if entry.instance.state() != InstanceState::Uninitialized {
        return;
    }
    let instance = Arc::clone(&entry.instance);
    tokio::spawn(async move {
        // Failures are recorded on the instance and reported per dispatch.
        let _ = instance.ensure_ready().await;
    });
}

impl ReloadTarget for AppCache {
    fn reload_directory<'a>(&'a self, dir: &'a Path) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Err(e) = self.rebuild_directory(dir).await {
                tracing::debug!(app = %self.name, "Reload left entries failed: {e}");
            }
        })
    }
}
