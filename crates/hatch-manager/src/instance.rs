use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hatch_core::ApplicationSpec;
use hatch_runtime::{GuestCall, GuestOutcome};
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::error::ManagerError;
use crate::metrics::ManagerMetrics;
use crate::pool::WorkerPool;

/// Lifecycle of one application instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InstanceState {
    Uninitialized = 0,
    StartupPending = 1,
    Ready = 2,
    Failed = 3,
    ShutdownPending = 4,
    Terminated = 5,
}

impl InstanceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => InstanceState::Uninitialized,
            1 => InstanceState::StartupPending,
            2 => InstanceState::Ready,
            3 => InstanceState::Failed,
            4 => InstanceState::ShutdownPending,
            _ => InstanceState::Terminated,
        }
    }
}

/// Readiness reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum AppHealth {
    Starting,
    Ready,
    Failed(String),
    Stopped,
}

impl AppHealth {
    pub fn is_ready(&self) -> bool {
        matches!(self, AppHealth::Ready)
    }
}

/// An application built from one [`ApplicationSpec`]: its worker pool plus
/// the startup state every dispatch checks first.
///
/// Workers (and with them the lifespan startup) are started exactly once,
/// by whichever caller gets there first; everyone else waits for that
/// outcome. A failure is sticky: the instance never serves again.
pub struct AppInstance {
    label: String,
    spec: ApplicationSpec,
    pool: Arc<WorkerPool>,
    state: AtomicU8,
    startup: OnceCell<Result<(), String>>,
    failure: Mutex<Option<String>>,
    metrics: Arc<ManagerMetrics>,
}

impl AppInstance {
    pub fn new(
        label: impl Into<String>,
        spec: ApplicationSpec,
        pool: Arc<WorkerPool>,
        metrics: Arc<ManagerMetrics>,
    ) -> Self {
        Self {
            label: label.into(),
            spec,
            pool,
            state: AtomicU8::new(InstanceState::Uninitialized as u8),
            startup: OnceCell::new(),
            failure: Mutex::new(None),
            metrics,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn spec(&self) -> &ApplicationSpec {
        &self.spec
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: InstanceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: InstanceState, to: InstanceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn failure_reason(&self) -> String {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "application failed".into())
    }

    /// Start the workers if nobody has yet, and wait for the outcome.
    pub async fn ensure_ready(&self) -> Result<(), ManagerError> {
        let started = self
            .startup
            .get_or_init(|| async {
                self.transition(InstanceState::Uninitialized, InstanceState::StartupPending);
                match self.pool.start().await {
                    Ok(()) => {
                        self.transition(InstanceState::StartupPending, InstanceState::Ready);
                        tracing::info!(app = %self.label, entry = %self.spec.entry, "Application ready");
                        Ok(())
                    }
                    Err(e) => {
                        self.metrics.record_startup_failure();
                        tracing::error!(app = %self.label, entry = %self.spec.entry, "Application failed to start: {e}");
                        let reason = match e {
                            ManagerError::StartupFailure { reason, .. } => reason,
                            other => other.to_string(),
                        };
                        self.mark_failed(reason.clone());
                        Err(reason)
                    }
                }
            })
            .await;

        if let Err(reason) = started {
            if matches!(
                self.state(),
                InstanceState::ShutdownPending | InstanceState::Terminated
            ) {
                return Err(ManagerError::ShuttingDown);
            }
            return Err(ManagerError::StartupFailure {
                app: self.label.clone(),
                reason: reason.clone(),
            });
        }
        self.check_usable()
    }

    fn check_usable(&self) -> Result<(), ManagerError> {
        match self.state() {
            InstanceState::Failed => Err(ManagerError::Unavailable(format!(
                "{}: {}",
                self.label,
                self.failure_reason()
            ))),
            InstanceState::ShutdownPending | InstanceState::Terminated => Err(ManagerError::ShuttingDown),
            _ => Ok(()),
        }
    }

    pub async fn dispatch(&self, call: GuestCall) -> Result<GuestOutcome, ManagerError> {
        self.ensure_ready().await?;
        self.pool.dispatch(call).await
    }

    /// Refuse every later dispatch. Only a replacement instance serves again.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
        let current = self.state();
        if !matches!(
            current,
            InstanceState::ShutdownPending | InstanceState::Terminated
        ) {
            self.set_state(InstanceState::Failed);
        }
    }

    /// Stop the instance: drain the pool, run lifespan shutdown, stop workers.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if self
            .startup
            .set(Err("shut down before start".into()))
            .is_ok()
        {
            self.set_state(InstanceState::Terminated);
            return;
        }
        // Startup may still be running; let it finish first.
        let _ = self
            .startup
            .get_or_init(|| async { Err("shut down before start".to_string()) })
            .await;

        let previous = InstanceState::from_u8(
            self.state
                .swap(InstanceState::ShutdownPending as u8, Ordering::AcqRel),
        );
        if matches!(
            previous,
            InstanceState::ShutdownPending | InstanceState::Terminated
        ) {
            return;
        }
        tracing::debug!(app = %self.label, "Shutting down application instance");
        self.pool.shutdown(drain_timeout).await;
        self.set_state(InstanceState::Terminated);
    }

    pub fn health(&self) -> AppHealth {
        match self.state() {
            InstanceState::Uninitialized | InstanceState::StartupPending => AppHealth::Starting,
            InstanceState::Ready => AppHealth::Ready,
            InstanceState::Failed => AppHealth::Failed(self.failure_reason()),
            InstanceState::ShutdownPending | InstanceState::Terminated => AppHealth::Stopped,
        }
    }
}
