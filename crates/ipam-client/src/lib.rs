//! IPAM Lease Client
//!
//! Reads and writes the IPAM custom resource that the external address
//! allocator watches. The controller appends address requests to
//! `spec.hostSpecs`; the allocator answers in `status.ipStatus`.
//!
//! All access is a full-object get/update cycle. Updates carry the
//! `resourceVersion` of the object they were derived from, so a concurrent
//! writer surfaces as [`LeaseError::Conflict`] instead of a lost update.
//!
//! # Example
//!
//! ```no_run
//! use ipam_client::{LeaseClient, LeaseClientTrait};
//! use crds::HostSpec;
//!
//! # async fn example(client: kube::Client) -> Result<(), ipam_client::LeaseError> {
//! let leases = LeaseClient::new(client);
//! let mut ipam = leases.get("kube-system", "lbops-ipam").await?;
//! ipam.spec.host_specs.push(HostSpec {
//!     host: "foo.com".to_string(),
//!     key: String::new(),
//!     ipam_label: "prod".to_string(),
//! });
//! leases.update(&ipam).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod lease_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::LeaseClient;
pub use error::LeaseError;
pub use lease_trait::LeaseClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockLeaseClient;
