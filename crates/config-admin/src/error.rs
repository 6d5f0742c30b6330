use thiserror::Error;

/// Errors from Configuration Admin operations.
#[derive(Error, Debug)]
pub enum ConfigAdminError {
    #[error("persistence failure for {pid}: {reason}")]
    Persistence { pid: String, reason: String },

    #[error("configuration {0} has been deleted")]
    Deleted(String),

    #[error("invalid PID: {0:?}")]
    InvalidPid(String),

    #[error("invalid filter at offset {offset}: {reason}")]
    InvalidFilter { offset: usize, reason: String },

    #[error("configuration manager is not active")]
    Inactive,

    #[error("coordination {0} is already terminated")]
    CoordinationTerminated(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid setup: {0}")]
    Setup(String),

    #[error("configuration loading failed: {0}")]
    Config(#[from] config::ConfigError),
}

impl ConfigAdminError {
    pub fn persistence(pid: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ConfigAdminError::Persistence {
            pid: pid.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for ConfigAdminError {
    fn from(e: serde_json::Error) -> Self {
        ConfigAdminError::Serialization(e.to_string())
    }
}

/// Error raised by a target while handling an update or removal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("target rejected configuration: {0}")]
pub struct TargetError(pub String);

/// Error raised by an asynchronous configuration listener.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

/// Result type for Configuration Admin operations.
pub type Result<T> = std::result::Result<T, ConfigAdminError>;
