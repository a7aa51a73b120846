use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// The calling convention a guest application speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallingConvention {
    /// One callable invoked with an environment map, returning status, headers and chunks.
    Sync,
    /// Scope plus a stream of typed messages in both directions.
    Async,
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallingConvention::Sync => write!(f, "sync"),
            CallingConvention::Async => write!(f, "async"),
        }
    }
}

impl FromStr for CallingConvention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" | "wsgi" => Ok(CallingConvention::Sync),
            "async" | "asgi" => Ok(CallingConvention::Async),
            other => Err(format!("unknown calling convention: {other}")),
        }
    }
}

/// How application instances are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConcurrencyModel {
    /// Isolated worker processes, each with its own guest runtime.
    #[default]
    #[serde(rename = "process")]
    MultiProcess,
    /// One guest runtime shared in-process by every application using this model.
    #[serde(rename = "thread")]
    SingleThreaded,
}

impl fmt::Display for ConcurrencyModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcurrencyModel::MultiProcess => write!(f, "process"),
            ConcurrencyModel::SingleThreaded => write!(f, "thread"),
        }
    }
}

/// A `module:attribute` pair naming a guest callable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryPoint {
    pub module: String,
    pub attribute: String,
}

impl EntryPoint {
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let mut parts = pattern.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(module), Some(attribute), None)
                if !module.trim().is_empty() && !attribute.trim().is_empty() =>
            {
                Ok(Self {
                    module: module.trim().to_string(),
                    attribute: attribute.trim().to_string(),
                })
            }
            _ => Err(ConfigError::InvalidEntryPoint(pattern.to_string())),
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.attribute)
    }
}

/// Number of process workers used when none is configured.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Immutable descriptor an application instance is built from.
///
/// One per static application, or synthesized per resolved [`CacheKey`] for
/// dynamic applications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub entry: EntryPoint,
    pub convention: CallingConvention,
    #[serde(default)]
    pub lifespan: bool,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    #[serde(default)]
    pub concurrency: ConcurrencyModel,
    pub workers: usize,
}

impl ApplicationSpec {
    pub fn new(entry: EntryPoint, convention: CallingConvention) -> Self {
        Self {
            entry,
            convention,
            lifespan: false,
            working_directory: None,
            search_paths: Vec::new(),
            concurrency: ConcurrencyModel::default(),
            workers: default_workers(),
        }
    }

    pub fn with_lifespan(mut self, lifespan: bool) -> Self {
        self.lifespan = lifespan;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    /// Selecting the single-threaded model pins the pool to one worker.
    pub fn with_concurrency(mut self, concurrency: ConcurrencyModel) -> Self {
        self.concurrency = concurrency;
        if concurrency == ConcurrencyModel::SingleThreaded {
            self.workers = 1;
        }
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = match self.concurrency {
            ConcurrencyModel::SingleThreaded => 1,
            ConcurrencyModel::MultiProcess => workers.max(1),
        };
        self
    }

    /// Whether the lifespan sub-protocol runs for instances of this spec.
    pub fn uses_lifespan(&self) -> bool {
        self.lifespan && self.convention == CallingConvention::Async
    }

    /// Directory the application's sources are loaded from, made absolute.
    pub fn source_root(&self) -> Option<PathBuf> {
        self.working_directory.as_deref().map(absolute_dir)
    }

    /// The source root, or the current directory when none is configured.
    ///
    /// Modules are registered under this directory and reloads purge by it.
    pub fn origin(&self) -> PathBuf {
        self.source_root()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_default()
    }

    /// Copy of this spec pointed at a request-time resolved target.
    pub fn retarget(&self, target: &ResolvedTarget) -> Result<Self, ConfigError> {
        let mut spec = self.clone();
        spec.entry = EntryPoint::parse(&target.entry)?;
        spec.working_directory = if target.working_directory.is_empty() {
            None
        } else {
            Some(PathBuf::from(&target.working_directory))
        };
        spec.search_paths = target.search_paths.iter().map(PathBuf::from).collect();
        Ok(spec)
    }

    /// The cache key a static application is stored under.
    pub fn cache_key(&self) -> CacheKey {
        ResolvedTarget {
            entry: self.entry.to_string(),
            working_directory: self
                .working_directory
                .as_deref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            search_paths: self
                .search_paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
        }
        .cache_key()
    }
}

/// Canonical form of a directory when it exists, otherwise its absolute form.
pub fn absolute_dir(dir: &Path) -> PathBuf {
    std::fs::canonicalize(dir)
        .or_else(|_| std::path::absolute(dir))
        .unwrap_or_else(|_| dir.to_path_buf())
}

/// Output of a dynamic resolver: already-substituted strings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedTarget {
    pub entry: String,
    pub working_directory: String,
    pub search_paths: Vec<String>,
}

impl ResolvedTarget {
    pub fn new(
        entry: impl Into<String>,
        working_directory: impl Into<String>,
        search_paths: Vec<String>,
    ) -> Self {
        Self {
            entry: entry.into(),
            working_directory: working_directory.into(),
            search_paths,
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(
            self.entry.clone(),
            self.working_directory.clone(),
            self.search_paths.clone(),
        )
    }
}

/// Composite key of resolved strings identifying one cached application.
///
/// Equality is exact string equality on every field. Search paths stay a
/// list, so no separator inside a path can make two lists compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    entry: String,
    working_directory: String,
    search_paths: Vec<String>,
}

impl CacheKey {
    pub fn new(
        entry: impl Into<String>,
        working_directory: impl Into<String>,
        search_paths: Vec<String>,
    ) -> Self {
        Self {
            entry: entry.into(),
            working_directory: working_directory.into(),
            search_paths,
        }
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn working_directory(&self) -> &str {
        &self.working_directory
    }

    pub fn search_paths(&self) -> &[String] {
        &self.search_paths
    }

    /// Short stable digest used to tag log events.
    pub fn short_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.entry.as_bytes());
        hasher.update([0]);
        hasher.update(self.working_directory.as_bytes());
        for path in &self.search_paths {
            hasher.update([0]);
            hasher.update((path.len() as u64).to_le_bytes());
            hasher.update(path.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        digest[..12].to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{:?}",
            self.entry, self.working_directory, self.search_paths
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_requires_module_and_attribute() {
        let entry = EntryPoint::parse("main:app").unwrap();
        assert_eq!(entry.module, "main");
        assert_eq!(entry.attribute, "app");
        assert_eq!(entry.to_string(), "main:app");

        assert!(EntryPoint::parse("main").is_err());
        assert!(EntryPoint::parse("main:app:extra").is_err());
        assert!(EntryPoint::parse(":app").is_err());
        assert!(EntryPoint::parse("main:").is_err());
    }

    #[test]
    fn single_threaded_forces_one_worker() {
        let entry = EntryPoint::parse("main:app").unwrap();
        let spec = ApplicationSpec::new(entry, CallingConvention::Sync)
            .with_concurrency(ConcurrencyModel::SingleThreaded)
            .with_workers(8);
        assert_eq!(spec.workers, 1);
    }

    #[test]
    fn lifespan_only_applies_to_async() {
        let entry = EntryPoint::parse("main:app").unwrap();
        let sync = ApplicationSpec::new(entry.clone(), CallingConvention::Sync).with_lifespan(true);
        let asgi = ApplicationSpec::new(entry, CallingConvention::Async).with_lifespan(true);
        assert!(!sync.uses_lifespan());
        assert!(asgi.uses_lifespan());
    }

    #[test]
    fn cache_keys_compare_every_field() {
        let a = ResolvedTarget::new("tenantA:app", "/srv/tenantA", vec![]).cache_key();
        let b = ResolvedTarget::new("tenantB:app", "/srv/tenantB", vec![]).cache_key();
        let a2 = CacheKey::new("tenantA:app", "/srv/tenantA", vec![]);
        assert_ne!(a, b);
        assert_eq!(a, a2);
        assert_eq!(a.short_id(), a2.short_id());
        assert_ne!(a.short_id(), b.short_id());

        // A separator inside one path must not alias a longer list.
        let joined = ResolvedTarget::new("m:app", "/d", vec!["/a:b".into()]).cache_key();
        let split = ResolvedTarget::new("m:app", "/d", vec!["/a".into(), "b".into()]).cache_key();
        assert_ne!(joined, split);
        assert_ne!(joined.short_id(), split.short_id());
        assert_eq!(split.search_paths(), ["/a".to_string(), "b".to_string()]);

        let none = ResolvedTarget::new("m:app", "/d", vec![]).cache_key();
        let empty = ResolvedTarget::new("m:app", "/d", vec![String::new()]).cache_key();
        assert_ne!(none, empty);
        assert_ne!(none.short_id(), empty.short_id());
    }

    #[test]
    fn retarget_replaces_resolved_fields() {
        let entry = EntryPoint::parse("main:app").unwrap();
        let template = ApplicationSpec::new(entry, CallingConvention::Sync)
            .with_concurrency(ConcurrencyModel::SingleThreaded);
        let target = ResolvedTarget::new("site:app", "/srv/a", vec!["/srv/lib".into()]);
        let spec = template.retarget(&target).unwrap();
        assert_eq!(spec.entry.module, "site");
        assert_eq!(spec.working_directory, Some(PathBuf::from("/srv/a")));
        assert_eq!(spec.search_paths, vec![PathBuf::from("/srv/lib")]);
        assert_eq!(spec.cache_key(), target.cache_key());
    }
}
