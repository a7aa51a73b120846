// hatch-runtime — guest runtimes for hatch
//
// The wasm runtime is ported from microsoft/wassette (MIT License).
// Copyright (c) Microsoft Corporation.

//! Guest runtimes for hatch.
//!
//! [`GuestRuntime`] is the single boundary between the application manager
//! and guest code. Two implementations ship:
//!
//! - [`WasmRuntime`]: WebAssembly components run by Wasmtime, the guest
//!   runtime family hatch serves in production.
//! - [`NativeRuntime`]: applications registered as Rust closures, for
//!   embedding hatch in a Rust host and for tests.
//!
//! Both keep a [`ModuleRegistry`]: an imported module stays registered, and
//! is reused by later imports, until the directory it came from is purged
//! with [`GuestRuntime::evict_modules`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hatch_core::{ApplicationSpec, CallingConvention, EntryPoint};
//! use hatch_runtime::{GuestCall, GuestRuntime, SyncRequest, WasmRuntime};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let runtime = WasmRuntime::new(None)?;
//! let spec = ApplicationSpec::new(EntryPoint::parse("site:app")?, CallingConvention::Sync)
//!     .with_working_directory("/srv/site");
//! let callable = runtime.load_module(&spec).await?;
//! let outcome = runtime
//!     .invoke(&callable, GuestCall::Sync(SyncRequest {
//!         environ: Default::default(),
//!         input: Default::default(),
//!     }))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod guest;
pub mod native;
pub mod registry;
pub mod runtime_context;
pub mod storage;
pub mod wasistate;
pub mod wasm;

pub use error::RuntimeError;
pub use guest::{
    GuestCall, GuestCallable, GuestChannel, GuestOutcome, GuestRuntime, HostChannel, SyncRequest,
    SyncResponse,
};
pub use native::{ModuleContext, NativeModule, NativeRuntime};
pub use registry::{ModuleKey, ModuleRegistry};
pub use wasm::WasmRuntime;
