use hatch_core::ConfigError;
use hatch_runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("application {app} failed to start: {reason}")]
    StartupFailure { app: String, reason: String },

    #[error("worker {worker} failed: {reason}")]
    WorkerFailure { worker: String, reason: String },

    #[error("guest execution failed: {0}")]
    GuestExecution(String),

    #[error("reload of {key} failed: {reason}")]
    ReloadFailure { key: String, reason: String },

    #[error("application unavailable: {0}")]
    Unavailable(String),

    #[error("unknown application: {0}")]
    UnknownApp(String),

    #[error("manager is shutting down")]
    ShuttingDown,

    #[error("worker protocol error: {0}")]
    Protocol(String),

    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ManagerError {
    /// Failure raised while guest code was running a request.
    pub fn guest(err: RuntimeError) -> Self {
        match err {
            RuntimeError::GuestError(message) => ManagerError::GuestExecution(message),
            other => ManagerError::GuestExecution(other.to_string()),
        }
    }

    pub fn is_worker_failure(&self) -> bool {
        matches!(self, ManagerError::WorkerFailure { .. })
    }
}
