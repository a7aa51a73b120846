use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Module not found: {module} (searched {searched:?})")]
    ModuleNotFound {
        module: String,
        searched: Vec<PathBuf>,
    },

    #[error("Module {module} has no attribute {attribute}")]
    AttributeNotFound { module: String, attribute: String },

    #[error("Import failed: {0}")]
    ImportFailed(String),

    #[error("Compilation failed: {0}")]
    CompilationFailed(String),

    #[error("Instantiation failed: {0}")]
    InstantiationFailed(String),

    #[error("Invocation failed: {0}")]
    InvocationFailed(String),

    #[error("Guest raised: {0}")]
    GuestError(String),

    #[error("{entry} does not speak the {expected} calling convention")]
    ConventionMismatch { entry: String, expected: String },

    #[error("Callable was produced by a different runtime: {0}")]
    ForeignCallable(String),

    #[error("Message channel closed")]
    ChannelClosed,

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
