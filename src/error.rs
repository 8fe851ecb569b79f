//! Framework error type
//!
//! Every subsystem surfaces failures through [`CdmfError`]. Activators and
//! listeners are user code; their failures are contained by the framework and
//! only reach callers wrapped in `ActivatorFailed`.

use thiserror::Error;

use crate::concurrency::Closed;

/// Framework errors
#[derive(Debug, Error)]
pub enum CdmfError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Dependency resolution failed: {0}")]
    ResolveFailed(String),

    #[error("Unresolvable dependency: {0}")]
    Unresolvable(String),

    #[error("Module activator failed: {0}")]
    ActivatorFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Queue is closed")]
    Closed,

    #[error("Module verification failed: {0}")]
    VerifyFailed(String),

    #[error("Configuration {0} has been deleted")]
    Deleted(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to load module artifact: {0}")]
    ArtifactLoad(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CdmfError>;

impl From<Closed> for CdmfError {
    fn from(_: Closed) -> Self {
        CdmfError::Closed
    }
}

impl From<serde_json::Error> for CdmfError {
    fn from(e: serde_json::Error) -> Self {
        CdmfError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for CdmfError {
    fn from(e: toml::de::Error) -> Self {
        CdmfError::Serialization(e.to_string())
    }
}

impl From<libloading::Error> for CdmfError {
    fn from(e: libloading::Error) -> Self {
        CdmfError::ArtifactLoad(e.to_string())
    }
}

impl CdmfError {
    /// Shorthand for `InvalidArgument`
    pub fn invalid(msg: impl Into<String>) -> Self {
        CdmfError::InvalidArgument(msg.into())
    }

    /// Shorthand for `NotFound`
    pub fn not_found(msg: impl Into<String>) -> Self {
        CdmfError::NotFound(msg.into())
    }

    /// Shorthand for `PermissionDenied`
    pub fn denied(msg: impl Into<String>) -> Self {
        CdmfError::PermissionDenied(msg.into())
    }
}
