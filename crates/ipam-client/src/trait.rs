//! LeaseClient trait for mocking
//!
//! The concrete [`LeaseClient`](crate::LeaseClient) talks to the Kubernetes
//! API; tests use [`MockLeaseClient`](crate::MockLeaseClient) behind the
//! `test-util` feature.

use crate::error::LeaseError;
use crds::IPAM;

/// Full-object access to the IPAM lease resource
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait LeaseClientTrait: Send + Sync {
    /// Fetch the lease object
    async fn get(&self, namespace: &str, name: &str) -> Result<IPAM, LeaseError>;

    /// Replace the lease object's spec
    ///
    /// Fails with [`LeaseError::Conflict`] when `ipam` was derived from a
    /// stale resourceVersion.
    async fn update(&self, ipam: &IPAM) -> Result<IPAM, LeaseError>;
}
