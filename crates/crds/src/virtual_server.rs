//! VirtualServer CRD
//!
//! Declares an L7 (HTTP/HTTPS) listener: a host (or hostgroup) served on a
//! virtual address, with path-based pools behind it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use crate::pool::Pool;

/// `httpTraffic` value: drop plain HTTP for a TLS VirtualServer
pub const HTTP_TRAFFIC_NONE: &str = "none";
/// `httpTraffic` value: serve plain HTTP alongside HTTPS
pub const HTTP_TRAFFIC_ALLOW: &str = "allow";
/// `httpTraffic` value: redirect plain HTTP to HTTPS
pub const HTTP_TRAFFIC_REDIRECT: &str = "redirect";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "lbops.microscaler.io",
    version = "v1",
    kind = "VirtualServer",
    namespaced,
    status = "VirtualServerStatus",
    shortname = "vs"
)]
/// An L7 listener for one host, shared by its group
#[serde(rename_all = "camelCase")]
pub struct VirtualServerSpec {
    /// Host served by this VirtualServer (may be empty for hostless virtuals)
    #[serde(default)]
    pub host: String,

    /// Explicit grouping key; VirtualServers sharing a hostGroup share one listener
    #[serde(default)]
    pub host_group: String,

    /// Explicit virtual address (takes priority over ipamLabel)
    #[serde(default)]
    pub virtual_server_address: String,

    /// Lease label used to request an address from the IPAM allocator
    #[serde(default)]
    pub ipam_label: String,

    /// Explicit listener name (otherwise derived from address and port)
    #[serde(default)]
    pub virtual_server_name: String,

    /// Custom HTTP port (defaults to 80)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_server_http_port: Option<i32>,

    /// Custom HTTPS port (defaults to 443)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_server_https_port: Option<i32>,

    /// Path-based pools
    #[serde(default)]
    pub pools: Vec<Pool>,

    /// Name of a TLSProfile in the same namespace
    #[serde(default)]
    pub tls_profile_name: String,

    /// Plain HTTP handling for TLS VirtualServers: none, allow or redirect
    #[serde(default)]
    pub http_traffic: String,

    /// Name of a Policy in the same namespace
    #[serde(default)]
    pub policy_name: String,

    /// SNAT mode or pool name (overrides the policy value)
    #[serde(default)]
    pub snat: String,

    /// WAF policy reference (overrides the policy value)
    #[serde(default)]
    pub waf: String,

    /// iRules attached to the listener
    #[serde(default)]
    pub i_rules: Vec<String>,

    /// VLANs the listener is enabled on
    #[serde(default)]
    pub allow_vlans: Vec<String>,

    /// Persistence profile (overrides the policy value)
    #[serde(default)]
    pub persistence_profile: String,
}

/// Observed state of a VirtualServer
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerStatus {
    /// Address the listener is bound to
    #[serde(default)]
    pub vs_address: String,

    /// "Ok" once the address has been assigned
    #[serde(default)]
    pub status_ok: String,
}

impl VirtualServer {
    /// True when a TLSProfile is referenced
    pub fn is_tls(&self) -> bool {
        !self.spec.tls_profile_name.is_empty()
    }

    /// True when the VirtualServer serves plain HTTP traffic
    pub fn handles_http(&self) -> bool {
        if !self.is_tls() {
            return true;
        }
        self.spec.http_traffic == HTTP_TRAFFIC_ALLOW || self.spec.http_traffic == HTTP_TRAFFIC_REDIRECT
    }

    /// Effective HTTP port
    pub fn http_port(&self) -> i32 {
        self.spec.virtual_server_http_port.unwrap_or(80)
    }

    /// Effective HTTPS port
    pub fn https_port(&self) -> i32 {
        self.spec.virtual_server_https_port.unwrap_or(443)
    }
}
