//! Runtime workers: one execution context able to run guest code.
//!
//! A [`process::ProcessWorker`] owns a child process with its own guest
//! runtime and talks to it over the frame protocol in [`protocol`]. A
//! [`thread::ThreadSlotWorker`] is a handle into the single in-process
//! runtime shared by every single-threaded application. Pools are written
//! once against [`RuntimeWorker`] and never see the difference.

pub mod process;
pub mod protocol;
pub mod thread;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use hatch_core::ApplicationSpec;
use hatch_runtime::{GuestCall, GuestOutcome};

use crate::error::ManagerError;

use self::process::WorkerLauncher;
use self::thread::SharedRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Process,
    ThreadSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Ready = 1,
    Busy = 2,
    Draining = 3,
    Dead = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Starting,
            1 => WorkerState::Ready,
            2 => WorkerState::Busy,
            3 => WorkerState::Draining,
            _ => WorkerState::Dead,
        }
    }
}

/// Lock-free cell holding a [`WorkerState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: WorkerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`. Fails if the cell no longer holds `from`.
    pub fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Timeouts and lifecycle flags a worker is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub lifespan: bool,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl WorkerSettings {
    pub fn for_spec(spec: &ApplicationSpec, startup_timeout: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            lifespan: spec.uses_lifespan(),
            startup_timeout,
            shutdown_timeout,
        }
    }
}

/// One execution context owned by exactly one pool.
pub trait RuntimeWorker: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> WorkerKind;

    fn state(&self) -> WorkerState;

    /// Claim the worker for one dispatch. `false` if it cannot take one now.
    fn try_reserve(&self) -> bool;

    /// Return a claim taken with [`try_reserve`](RuntimeWorker::try_reserve).
    fn release(&self);

    /// Run one call. A broken worker reports [`ManagerError::WorkerFailure`]
    /// and moves itself to [`WorkerState::Dead`].
    fn dispatch<'a>(
        &'a self,
        call: GuestCall,
    ) -> Pin<Box<dyn Future<Output = Result<GuestOutcome, ManagerError>> + Send + 'a>>;

    /// Stop the worker, waiting at most `timeout` before forcing it.
    fn shutdown<'a>(&'a self, timeout: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Creates the workers of one pool.
pub trait WorkerSpawner: Send + Sync {
    fn spawn<'a>(
        &'a self,
        id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn RuntimeWorker>, ManagerError>> + Send + 'a>>;
}

/// Where an application's workers run, selected by its concurrency model.
#[derive(Clone)]
pub enum Backend {
    Process(Arc<WorkerLauncher>),
    Thread(Arc<SharedRuntime>),
}

impl Backend {
    pub fn kind(&self) -> WorkerKind {
        match self {
            Backend::Process(_) => WorkerKind::Process,
            Backend::Thread(_) => WorkerKind::ThreadSlot,
        }
    }
}
