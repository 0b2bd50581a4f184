//! LBops CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the load-balancer controller.

pub mod pool;
pub mod virtual_server;
pub mod transport_server;
pub mod ingress_link;
pub mod external_dns;
pub mod policy;
pub mod tls_profile;
pub mod ipam;

pub use pool::*;
pub use virtual_server::*;
pub use transport_server::*;
pub use ingress_link::*;
pub use external_dns::*;
pub use policy::*;
pub use tls_profile::*;
pub use ipam::*;
