//! Central error types for the ingress status sync
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Central error type for the ingress status sync
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Resource not found in the cluster
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Write lost an optimistic-concurrency race against another writer
    #[error("Update conflict: {kind}/{name} in namespace {namespace} changed since it was read")]
    UpdateConflict {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Running addresses of the controller fleet could not be computed
    #[error("Address resolution failed: {0}")]
    ResolutionError(String),

    /// Lease store unreachable or lease record unusable
    #[error("Lease error: {0}")]
    LeaseError(String),
}

/// Result type alias for status sync operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Classify a kube-rs error for a named object, mapping HTTP 404 and 409
    /// to [`Error::NotFound`] and [`Error::UpdateConflict`].
    pub fn from_kube(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 404 => Error::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            kube::Error::Api(ref resp) if resp.code == 409 => Error::UpdateConflict {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            other => Error::KubeError(other),
        }
    }

    /// Check if this error is a lost optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::UpdateConflict { .. })
    }

    /// Check if this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
