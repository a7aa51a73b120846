//! Application runtime manager for hatch.
//!
//! [`ApplicationManager`] is what a host server talks to. Each registered
//! application is served through an [`AppCache`] of [`AppInstance`]s (one
//! for a static application, one per resolved target for a dynamic one),
//! each instance owns a [`WorkerPool`], and the [`bridge`] translates host
//! requests into the application's calling convention.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hatch_core::{AppConfig, ConcurrencyModel, HostRequest, ManagerConfig};
//! use hatch_manager::ApplicationManager;
//! use hatch_runtime::{NativeModule, NativeRuntime, SyncResponse};
//!
//! # async fn run() -> Result<(), hatch_manager::ManagerError> {
//! let runtime = NativeRuntime::new().with_module("hello", |_ctx| {
//!     Ok(NativeModule::new().with_sync("app", |_req| async {
//!         Ok(SyncResponse::new(200).with_chunk("hello"))
//!     }))
//! });
//! let manager = ApplicationManager::new(Arc::new(runtime), ManagerConfig::default());
//!
//! let app = AppConfig::new("hello")
//!     .with_module_sync("hello:app")
//!     .with_runtime(ConcurrencyModel::SingleThreaded);
//! manager.register(app, None).await?;
//!
//! let response = manager.dispatch_collect("hello", HostRequest::new("GET", "/")).await?;
//! assert_eq!(response.text(), "hello");
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod autoreload;
pub mod bridge;
pub mod cache;
pub mod error;
pub mod instance;
pub mod lifespan;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod serve;
pub mod worker;

pub use autoreload::{AutoreloadHandle, Debouncer, ReloadTarget};
pub use cache::{AppCache, AppCacheEntry, CacheSettings, EntryLease};
pub use error::ManagerError;
pub use instance::{AppHealth, AppInstance, InstanceState};
pub use manager::{ApplicationManager, DynamicResolver};
pub use metrics::{LoggingMetricsBackend, ManagerMetrics, MetricsBackend, MetricsSnapshot};
pub use pool::WorkerPool;
pub use serve::serve_worker;
pub use worker::{RuntimeWorker, WorkerKind, WorkerSettings, WorkerSpawner, WorkerState};
