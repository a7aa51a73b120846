use thiserror::Error;

/// Invalid application configuration. Always fatal at setup time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("expected pattern $(MODULE_NAME):$(VARIABLE_NAME), got {0:?}")]
    InvalidEntryPoint(String),

    #[error("application {app}: exactly one of module_sync or module_async must be set")]
    AmbiguousConvention { app: String },

    #[error("application {app}: lifespan is only supported with module_async")]
    LifespanWithoutAsync { app: String },

    #[error("application {app}: autoreload requires workers_runtime = \"thread\"")]
    AutoreloadRequiresThread { app: String },

    #[error("application {app}: dynamic loading requires workers_runtime = \"thread\"")]
    DynamicRequiresThread { app: String },

    #[error("application {app}: workers must be greater than zero")]
    ZeroWorkers { app: String },

    #[error("application {app}: dynamic application registered without a resolver")]
    MissingResolver { app: String },

    #[error("duplicate application name: {0}")]
    DuplicateApp(String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
