use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use hatch_core::ApplicationSpec;
use hatch_runtime::{GuestCall, GuestCallable, GuestOutcome, GuestRuntime, RuntimeError};
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};

use super::{RuntimeWorker, StateCell, WorkerKind, WorkerSettings, WorkerSpawner, WorkerState};
use crate::error::ManagerError;
use crate::lifespan::LifespanSession;

/// The single in-process guest runtime, shared by every application that
/// uses the single-threaded model.
///
/// Dispatches hold the slot shared and may overlap each other. Changes to
/// the runtime's module table hold it exclusively through a
/// [`MutationGuard`], so no dispatch ever overlaps a load or a purge.
///
/// A dispatch holds the slot until its guest call returns, which for a
/// streamed async response is the end of the stream. The lock is fair: once
/// a mutation is queued, dispatches that arrive later wait behind it, for
/// every thread-model application. A long stream therefore delays a first
/// build, a reload, and the requests queued after them.
pub struct SharedRuntime {
    runtime: Arc<dyn GuestRuntime>,
    slot: RwLock<()>,
}

impl SharedRuntime {
    pub fn new(runtime: Arc<dyn GuestRuntime>) -> Self {
        Self {
            runtime,
            slot: RwLock::new(()),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn GuestRuntime> {
        &self.runtime
    }

    pub async fn invoke(
        &self,
        callable: &GuestCallable,
        call: GuestCall,
    ) -> Result<GuestOutcome, RuntimeError> {
        let _shared = self.slot.read().await;
        self.runtime.invoke(callable, call).await
    }

    /// Invoke without holding the slot.
    ///
    /// Only for lifespan connections, which stay open for the whole life of
    /// an instance and would otherwise block every mutation.
    pub async fn invoke_unserialized(
        &self,
        callable: &GuestCallable,
        call: GuestCall,
    ) -> Result<GuestOutcome, RuntimeError> {
        self.runtime.invoke(callable, call).await
    }

    /// Take the exclusive mutation slot. Waits for in-flight dispatches.
    pub async fn mutate(&self) -> MutationGuard<'_> {
        let slot = self.slot.write().await;
        MutationGuard {
            runtime: self.runtime.as_ref(),
            _slot: slot,
        }
    }
}

/// Exclusive access to the shared runtime's module table.
pub struct MutationGuard<'a> {
    runtime: &'a dyn GuestRuntime,
    _slot: RwLockWriteGuard<'a, ()>,
}

impl MutationGuard<'_> {
    pub async fn load_module(&self, spec: &ApplicationSpec) -> Result<GuestCallable, RuntimeError> {
        self.runtime.load_module(spec).await
    }

    pub async fn evict_modules(&self, dir: &Path) -> usize {
        self.runtime.evict_modules(dir).await
    }
}

/// A pool's handle into the shared runtime.
///
/// Never becomes busy: requests overlap inside the runtime as far as the
/// guest allows. Holds the instance's lifespan connection when enabled.
pub struct ThreadSlotWorker {
    id: String,
    shared: Arc<SharedRuntime>,
    callable: GuestCallable,
    state: StateCell,
    lifespan: Mutex<Option<LifespanSession>>,
}

impl ThreadSlotWorker {
    pub async fn start(
        id: String,
        shared: Arc<SharedRuntime>,
        callable: GuestCallable,
        settings: WorkerSettings,
    ) -> Result<Self, ManagerError> {
        let mut lifespan = None;
        if settings.lifespan {
            let runtime = Arc::clone(&shared);
            let guest = callable.clone();
            let mut session = LifespanSession::begin(id.clone(), move |call| async move {
                runtime
                    .invoke_unserialized(&guest, call)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            });
            session.startup(settings.startup_timeout).await?;
            lifespan = Some(session);
        }
        tracing::debug!(worker = %id, entry = %callable.entry, "Thread slot worker ready");
        Ok(Self {
            id,
            shared,
            callable,
            state: StateCell::new(WorkerState::Ready),
            lifespan: Mutex::new(lifespan),
        })
    }
}

impl RuntimeWorker for ThreadSlotWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::ThreadSlot
    }

    fn state(&self) -> WorkerState {
        self.state.get()
    }

    fn try_reserve(&self) -> bool {
        self.state.get() == WorkerState::Ready
    }

    fn release(&self) {}

    fn dispatch<'a>(
        &'a self,
        call: GuestCall,
    ) -> Pin<Box<dyn Future<Output = Result<GuestOutcome, ManagerError>> + Send + 'a>> {
        Box::pin(async move {
            self.shared
                .invoke(&self.callable, call)
                .await
                .map_err(ManagerError::guest)
        })
    }

    fn shutdown<'a>(&'a self, timeout: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if self.state.get() == WorkerState::Dead {
                return;
            }
            self.state.set(WorkerState::Draining);
            if let Some(session) = self.lifespan.lock().await.take() {
                session.shutdown(timeout).await;
            }
            self.state.set(WorkerState::Dead);
            tracing::debug!(worker = %self.id, "Thread slot worker stopped");
        })
    }
}

/// Spawns thread-slot workers for an entry already loaded into the shared runtime.
pub struct ThreadSlotSpawner {
    shared: Arc<SharedRuntime>,
    callable: GuestCallable,
    settings: WorkerSettings,
}

impl ThreadSlotSpawner {
    pub fn new(shared: Arc<SharedRuntime>, callable: GuestCallable, settings: WorkerSettings) -> Self {
        Self {
            shared,
            callable,
            settings,
        }
    }
}

impl WorkerSpawner for ThreadSlotSpawner {
    fn spawn<'a>(
        &'a self,
        id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn RuntimeWorker>, ManagerError>> + Send + 'a>> {
        Box::pin(async move {
            let worker = ThreadSlotWorker::start(
                id,
                Arc::clone(&self.shared),
                self.callable.clone(),
                self.settings,
            )
            .await?;
            Ok(Arc::new(worker) as Arc<dyn RuntimeWorker>)
        })
    }
}
