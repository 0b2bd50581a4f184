//! Controller-specific error types.
//!
//! The reconcile taxonomy decides what happens to a failed work item:
//! validation and conflict errors wait for the user to change something,
//! logic errors only blank the affected listener, and transient errors
//! (including every Kubernetes and lease backend failure) are retried with
//! backoff.

use ipam_client::LeaseError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the load-balancer controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Malformed intent resource
    #[error("Invalid resource: {0}")]
    Validation(String),

    /// Incompatible members in one association group
    #[error("Group conflict: {0}")]
    Conflict(String),

    /// Lookup or update failed; worth retrying
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Policy or TLS mismatch for a single listener
    #[error("Cannot build listener: {0}")]
    Logic(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Lease backend error
    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// True when the work item should be re-enqueued with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::Transient(_) | ControllerError::Kube(_) | ControllerError::Lease(_)
        )
    }
}
