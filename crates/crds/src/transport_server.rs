//! TransportServer CRD
//!
//! Declares an L4 (TCP/UDP) listener on a virtual address and port with a
//! single backend pool.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use crate::pool::Pool;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "lbops.microscaler.io",
    version = "v1",
    kind = "TransportServer",
    namespaced,
    status = "TransportServerStatus",
    shortname = "ts"
)]
/// An L4 listener forwarding to one service port
#[serde(rename_all = "camelCase")]
pub struct TransportServerSpec {
    /// Explicit virtual address (takes priority over ipamLabel)
    #[serde(default)]
    pub virtual_server_address: String,

    /// Listener port
    pub virtual_server_port: i32,

    /// Explicit listener name (otherwise derived from address and port)
    #[serde(default)]
    pub virtual_server_name: String,

    /// Lease label used to request an address from the IPAM allocator
    #[serde(default)]
    pub ipam_label: String,

    /// Listener mode (standard or performance)
    #[serde(default)]
    pub mode: String,

    /// Transport protocol (tcp, udp, sctp); defaults to tcp
    #[serde(default, rename = "type")]
    pub type_: String,

    /// Backend pool
    pub pool: Pool,

    /// Name of a Policy in the same namespace
    #[serde(default)]
    pub policy_name: String,

    /// SNAT mode or pool name
    #[serde(default)]
    pub snat: String,

    /// iRules attached to the listener
    #[serde(default)]
    pub i_rules: Vec<String>,

    /// VLANs the listener is enabled on
    #[serde(default)]
    pub allow_vlans: Vec<String>,

    /// Persistence profile
    #[serde(default)]
    pub persistence_profile: String,
}

/// Observed state of a TransportServer
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransportServerStatus {
    /// Address the listener is bound to
    #[serde(default)]
    pub vs_address: String,

    /// "Ok" once the address has been assigned
    #[serde(default)]
    pub status_ok: String,
}

impl TransportServer {
    /// Effective transport protocol
    pub fn protocol(&self) -> &str {
        if self.spec.type_.is_empty() {
            "tcp"
        } else {
            &self.spec.type_
        }
    }
}
