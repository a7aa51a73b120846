use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hatch_core::{
    AppConfig, ApplicationSpec, ConcurrencyModel, ConfigError, HostRequest, HostResponse,
    ManagerConfig, ResolvedTarget, ResponseSink, WorkerConfig,
};
use hatch_runtime::GuestRuntime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::autoreload::AutoreloadHandle;
use crate::bridge;
use crate::cache::{AppCache, CacheSettings, EntryLease, WatchSettings};
use crate::error::ManagerError;
use crate::instance::AppHealth;
use crate::metrics::ManagerMetrics;
use crate::worker::Backend;
use crate::worker::process::WorkerLauncher;
use crate::worker::thread::SharedRuntime;

const COLLECT_CAPACITY: usize = 16;

/// Maps a request to the target a dynamic application serves it from.
///
/// The returned strings are used verbatim as the cache key.
pub trait DynamicResolver: Send + Sync {
    fn resolve(&self, request: &HostRequest) -> ResolvedTarget;
}

impl<F> DynamicResolver for F
where
    F: Fn(&HostRequest) -> ResolvedTarget + Send + Sync,
{
    fn resolve(&self, request: &HostRequest) -> ResolvedTarget {
        self(request)
    }
}

struct RegisteredApp {
    template: ApplicationSpec,
    resolver: Option<Arc<dyn DynamicResolver>>,
    cache: Arc<AppCache>,
}

impl RegisteredApp {
    async fn resolve(&self, request: &HostRequest) -> Result<EntryLease, ManagerError> {
        match &self.resolver {
            None => {
                self.cache
                    .resolve(self.template.cache_key(), || Ok(self.template.clone()))
                    .await
            }
            Some(resolver) => {
                let target = resolver.resolve(request);
                self.cache
                    .resolve(target.cache_key(), || Ok(self.template.retarget(&target)?))
                    .await
            }
        }
    }
}

/// The host-facing entry point: registered applications by name.
///
/// Every single-threaded application shares one in-process guest runtime.
/// Multi-process applications launch their own worker processes.
pub struct ApplicationManager {
    config: ManagerConfig,
    worker_config: WorkerConfig,
    shared: Arc<SharedRuntime>,
    apps: RwLock<HashMap<String, Arc<RegisteredApp>>>,
    autoreload: Mutex<Option<AutoreloadHandle>>,
    metrics: Arc<ManagerMetrics>,
    closed: AtomicBool,
}

impl ApplicationManager {
    pub fn new(runtime: Arc<dyn GuestRuntime>, config: ManagerConfig) -> Self {
        Self {
            config,
            worker_config: WorkerConfig::default(),
            shared: Arc::new(SharedRuntime::new(runtime)),
            apps: RwLock::new(HashMap::new()),
            autoreload: Mutex::new(None),
            metrics: Arc::new(ManagerMetrics::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_worker_config(mut self, worker_config: WorkerConfig) -> Self {
        self.worker_config = worker_config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ManagerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<ManagerMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub async fn app_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.apps.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate and register an application.
    ///
    /// Static applications are built immediately; a module that fails to
    /// load fails the registration. Lifespan startup runs in the background
    /// and is awaited by the first dispatch.
    pub async fn register(
        &self,
        config: AppConfig,
        resolver: Option<Arc<dyn DynamicResolver>>,
    ) -> Result<(), ManagerError> {
        let template = config.validate()?;
        let name = config.name.clone();
        if config.dynamic && resolver.is_none() {
            return Err(ConfigError::MissingResolver { app: name }.into());
        }
        if !config.dynamic && resolver.is_some() {
            tracing::warn!(app = %name, "Resolver given for a static application; ignoring it");
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ManagerError::ShuttingDown);
        }

        let mut apps = self.apps.write().await;
        if apps.contains_key(&name) {
            return Err(ConfigError::DuplicateApp(name).into());
        }

        let backend = match template.concurrency {
            ConcurrencyModel::SingleThreaded => Backend::Thread(Arc::clone(&self.shared)),
            ConcurrencyModel::MultiProcess => {
                Backend::Process(Arc::new(WorkerLauncher::from_config(&self.worker_config)?))
            }
        };
        let watch = if config.autoreload {
            Some(WatchSettings {
                handle: self.autoreloader().await?,
                extensions: config.watch_extensions.clone(),
                debounce: self.config.debounce(),
            })
        } else {
            None
        };
        let settings = CacheSettings::from_config(&self.config, config.dynamic).with_watch(watch);
        let cache = AppCache::new(name.clone(), backend, settings, Arc::clone(&self.metrics));

        let app = Arc::new(RegisteredApp {
            template,
            resolver: if config.dynamic { resolver } else { None },
            cache,
        });
        if !config.dynamic {
            let built = app
                .cache
                .resolve(app.template.cache_key(), || Ok(app.template.clone()))
                .await;
            if let Err(e) = built {
                tracing::error!(app = %name, "Failed to build application: {e}");
                app.cache.shutdown().await;
                return Err(e);
            }
        }

        tracing::info!(
            app = %name,
            entry = %app.template.entry,
            convention = %app.template.convention,
            runtime = %app.template.concurrency,
            workers = app.template.workers,
            dynamic = config.dynamic,
            autoreload = config.autoreload,
            "Registered application"
        );
        apps.insert(name, app);
        Ok(())
    }

    /// The shared autoreloader, started on first use.
    async fn autoreloader(&self) -> Result<AutoreloadHandle, ManagerError> {
        let mut slot = self.autoreload.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }
        let handle = AutoreloadHandle::spawn()?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    async fn app(&self, name: &str) -> Option<Arc<RegisteredApp>> {
        self.apps.read().await.get(name).cloned()
    }

    /// Serve one request for application `name`, streaming into `sink`.
    ///
    /// Whatever fails before a response head went out is answered with a
    /// bare 500 and also returned.
    pub async fn dispatch(
        &self,
        name: &str,
        request: HostRequest,
        sink: &mut ResponseSink,
    ) -> Result<(), ManagerError> {
        let started = Instant::now();
        self.metrics.record_dispatch();
        let result = self.route(name, request, sink).await;
        match &result {
            Ok(()) => self.metrics.record_dispatch_completed(started.elapsed()),
            Err(_) => self.metrics.record_dispatch_failure(),
        }
        result
    }

    async fn route(
        &self,
        name: &str,
        request: HostRequest,
        sink: &mut ResponseSink,
    ) -> Result<(), ManagerError> {
        let lease = if self.closed.load(Ordering::SeqCst) {
            Err(ManagerError::ShuttingDown)
        } else {
            match self.app(name).await {
                Some(app) => app.resolve(&request).await,
                None => Err(ManagerError::UnknownApp(name.to_string())),
            }
        };
        let lease = match lease {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(app = %name, path = %request.path, "Request not dispatched: {e}");
                sink.send_error().await;
                return Err(e);
            }
        };

        tracing::debug!(
            app = %name,
            key = %lease.key().short_id(),
            method = %request.method,
            path = %request.path,
            "Dispatching request"
        );
        bridge::handle(lease.instance(), request, sink).await
    }

    /// Serve one request and buffer the whole response.
    ///
    /// Failures come back as the 500 response the host would have seen.
    pub async fn dispatch_collect(
        &self,
        name: &str,
        request: HostRequest,
    ) -> Result<HostResponse, ManagerError> {
        let (mut sink, stream) = ResponseSink::channel(COLLECT_CAPACITY);
        let dispatch = async move {
            let result = self.dispatch(name, request, &mut sink).await;
            drop(sink);
            result
        };
        let (result, response) = tokio::join!(dispatch, stream.collect());
        match (response, result) {
            (Some(response), _) => Ok(response),
            (None, Err(e)) => Err(e),
            (None, Ok(())) => Err(ManagerError::GuestExecution(
                "application finished without a response".into(),
            )),
        }
    }

    pub async fn health(&self, name: &str) -> Result<AppHealth, ManagerError> {
        let app = self
            .app(name)
            .await
            .ok_or_else(|| ManagerError::UnknownApp(name.to_string()))?;
        Ok(app.cache.health().await)
    }

    /// Health of every registered application, by name.
    pub async fn health_all(&self) -> Vec<(String, AppHealth)> {
        let apps: Vec<(String, Arc<RegisteredApp>)> = self
            .apps
            .read()
            .await
            .iter()
            .map(|(name, app)| (name.clone(), Arc::clone(app)))
            .collect();
        let mut health = Vec::with_capacity(apps.len());
        for (name, app) in apps {
            health.push((name, app.cache.health().await));
        }
        health.sort_by(|a, b| a.0.cmp(&b.0));
        health
    }

    /// Rebuild every live entry of `name`. Returns how many were replaced.
    pub async fn reload(&self, name: &str) -> Result<usize, ManagerError> {
        let app = self
            .app(name)
            .await
            .ok_or_else(|| ManagerError::UnknownApp(name.to_string()))?;
        tracing::info!(app = %name, "Manual reload requested");
        app.cache.reload_all().await
    }

    /// Stop every application: drain in-flight requests, run lifespan
    /// shutdown and stop workers, each bounded by the configured timeouts.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down application manager");
        if let Some(handle) = self.autoreload.lock().await.take() {
            handle.shutdown();
        }

        let apps: Vec<Arc<RegisteredApp>> = self.apps.write().await.drain().map(|(_, app)| app).collect();
        let mut stops = JoinSet::new();
        for app in apps {
            stops.spawn(async move { app.cache.shutdown().await });
        }
        while stops.join_next().await.is_some() {}
        tracing::info!("Application manager stopped");
    }
}
