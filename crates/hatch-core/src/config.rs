use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::spec::{ApplicationSpec, CallingConvention, ConcurrencyModel, EntryPoint};

/// Top-level `hatch.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HatchConfig {
    #[serde(rename = "app", default)]
    pub apps: Vec<AppConfig>,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl HatchConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: HatchConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every application and reject duplicate names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for app in &self.apps {
            if !seen.insert(app.name.as_str()) {
                return Err(ConfigError::DuplicateApp(app.name.clone()));
            }
            app.validate()?;
        }
        Ok(())
    }

    pub fn app(&self, name: &str) -> Option<&AppConfig> {
        self.apps.iter().find(|a| a.name == name)
    }
}

/// One `[[app]]` table: a resolved configuration record for one application.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub module_sync: Option<String>,
    pub module_async: Option<String>,
    #[serde(default)]
    pub lifespan: bool,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    pub workers: Option<usize>,
    #[serde(default)]
    pub workers_runtime: ConcurrencyModel,
    #[serde(default)]
    pub autoreload: bool,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default = "default_watch_extensions")]
    pub watch_extensions: Vec<String>,
}

fn default_watch_extensions() -> Vec<String> {
    vec!["wasm".into()]
}

impl AppConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module_sync: None,
            module_async: None,
            lifespan: false,
            working_dir: None,
            search_paths: Vec::new(),
            workers: None,
            workers_runtime: ConcurrencyModel::default(),
            autoreload: false,
            dynamic: false,
            watch_extensions: default_watch_extensions(),
        }
    }

    pub fn with_module_sync(mut self, entry: impl Into<String>) -> Self {
        self.module_sync = Some(entry.into());
        self
    }

    pub fn with_module_async(mut self, entry: impl Into<String>) -> Self {
        self.module_async = Some(entry.into());
        self
    }

    pub fn with_lifespan(mut self, lifespan: bool) -> Self {
        self.lifespan = lifespan;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_runtime(mut self, runtime: ConcurrencyModel) -> Self {
        self.workers_runtime = runtime;
        self
    }

    pub fn with_autoreload(mut self, autoreload: bool) -> Self {
        self.autoreload = autoreload;
        self
    }

    pub fn with_dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn with_watch_extensions(mut self, extensions: Vec<String>) -> Self {
        self.watch_extensions = extensions;
        self
    }

    pub fn convention(&self) -> Result<(CallingConvention, &str), ConfigError> {
        match (self.module_sync.as_deref(), self.module_async.as_deref()) {
            (Some(entry), None) => Ok((CallingConvention::Sync, entry)),
            (None, Some(entry)) => Ok((CallingConvention::Async, entry)),
            _ => Err(ConfigError::AmbiguousConvention {
                app: self.name.clone(),
            }),
        }
    }

    /// Validate the record and turn it into an [`ApplicationSpec`].
    ///
    /// For dynamic applications the result is a template; the entry point,
    /// working directory and search paths are replaced per request.
    pub fn validate(&self) -> Result<ApplicationSpec, ConfigError> {
        let (convention, entry) = self.convention()?;
        let entry = EntryPoint::parse(entry)?;
        let app = || self.name.clone();

        if self.lifespan && convention != CallingConvention::Async {
            return Err(ConfigError::LifespanWithoutAsync { app: app() });
        }
        let threaded = self.workers_runtime == ConcurrencyModel::SingleThreaded;
        if self.autoreload && !threaded {
            return Err(ConfigError::AutoreloadRequiresThread { app: app() });
        }
        if self.dynamic && !threaded {
            return Err(ConfigError::DynamicRequiresThread { app: app() });
        }
        if self.workers == Some(0) {
            return Err(ConfigError::ZeroWorkers { app: app() });
        }
        if threaded && let Some(requested) = self.workers.filter(|n| *n > 1) {
            tracing::warn!(
                app = %self.name,
                requested,
                "Thread runtime uses exactly one worker, ignoring configured count"
            );
        }

        let mut spec = ApplicationSpec::new(entry, convention)
            .with_lifespan(self.lifespan)
            .with_search_paths(self.search_paths.clone())
            .with_concurrency(self.workers_runtime);
        if let Some(dir) = &self.working_dir {
            spec = spec.with_working_directory(dir.clone());
        }
        if let Some(workers) = self.workers {
            spec = spec.with_workers(workers);
        }
        Ok(spec)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    pub max_dynamic_entries: Option<usize>,
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_grace_period_ms() -> u64 {
    10_000
}
fn default_debounce_ms() -> u64 {
    500
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_timeout_ms(),
            shutdown_timeout_ms: default_timeout_ms(),
            drain_timeout_ms: default_timeout_ms(),
            grace_period_ms: default_grace_period_ms(),
            debounce_ms: default_debounce_ms(),
            max_dynamic_entries: None,
        }
    }
}

impl ManagerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// How process workers are launched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerConfig {
    /// Worker executable. Defaults to the running binary.
    pub program: Option<PathBuf>,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
}

fn default_worker_args() -> Vec<String> {
    vec!["worker".into()]
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: default_worker_args(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RuntimeConfig {
    /// Directory for precompiled components. Defaults to `~/.hatch/cache`.
    pub cache_dir: Option<PathBuf>,
}
