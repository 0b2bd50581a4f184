//! Lease client errors

use thiserror::Error;

/// Errors that can occur when reading or writing the IPAM lease object
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease object does not exist
    #[error("IPAM object not found: {0}")]
    NotFound(String),

    /// The lease object changed since it was read
    #[error("IPAM object was modified concurrently: {0}")]
    Conflict(String),

    /// The lease backend could not be reached
    #[error("IPAM backend unavailable: {0}")]
    Unavailable(String),

    /// The lease object carries no name or namespace
    #[error("Invalid IPAM object reference: {0}")]
    InvalidReference(String),
}

impl LeaseError {
    /// True for a stale resourceVersion on update
    pub fn is_conflict(&self) -> bool {
        matches!(self, LeaseError::Conflict(_))
    }
}
