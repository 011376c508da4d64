use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("config file not found at {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("package descriptor {path} is invalid: {reason}")]
    PackageFormat { path: PathBuf, reason: String },

    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    #[error("container process {instance} failed: {message}")]
    Process { instance: usize, message: String },

    #[error("distribution to port {port} failed: {message}")]
    Distribution { port: u16, message: String },

    #[error("control call to port {port} failed: {message}")]
    Control { port: u16, message: String },

    #[error("{operation} on port {port} timed out")]
    Timeout { port: u16, operation: &'static str },

    #[error("container on port {port} is unhealthy: {reason}")]
    Unhealthy { port: u16, reason: String },

    #[error("assembly load failed: {0}")]
    LoadFailed(String),

    #[error("shutdown failed: {0}")]
    Shutdown(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ComputeError {
    /// Whether package discovery should retry after this error instead of giving up.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ComputeError::PackageFormat { .. })
    }
}

pub type Result<T> = std::result::Result<T, ComputeError>;
