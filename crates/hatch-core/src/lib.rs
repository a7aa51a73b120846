//! Core data model for hatch.
//!
//! Everything that crosses crate boundaries lives here: the immutable
//! [`ApplicationSpec`] an application instance is built from, the
//! [`CacheKey`] dynamic applications are looked up by, the host-side
//! request/response plumbing, and the message types of both calling
//! conventions.

pub mod config;
pub mod error;
pub mod message;
pub mod request;
pub mod spec;

pub use config::{AppConfig, HatchConfig, ManagerConfig, RuntimeConfig, WorkerConfig};
pub use error::ConfigError;
pub use message::{AsgiMessage, AsgiVersion, Environ, HttpScope, Scope};
pub use request::{
    ClientDisconnected, HostRequest, HostResponse, RequestBody, ResponseEvent, ResponseSink,
    ResponseStream,
};
pub use spec::{
    ApplicationSpec, CacheKey, CallingConvention, ConcurrencyModel, EntryPoint, ResolvedTarget,
};
