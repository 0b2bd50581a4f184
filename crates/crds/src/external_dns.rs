//! ExternalDNS CRD
//!
//! Declares a DNS wide-IP whose pools aggregate the listeners serving the
//! domain.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "lbops.microscaler.io",
    version = "v1",
    kind = "ExternalDNS",
    namespaced,
    shortname = "edns"
)]
/// A DNS name load-balanced across the listeners serving it
#[serde(rename_all = "camelCase")]
pub struct ExternalDNSSpec {
    /// Fully qualified domain name
    pub domain_name: String,

    /// DNS record type (defaults to A)
    #[serde(default)]
    pub dns_record_type: String,

    /// Wide-IP load balancing method (defaults to round-robin)
    #[serde(default)]
    pub load_balance_method: String,

    /// GSLB pools behind the domain
    #[serde(default)]
    pub pools: Vec<DNSPool>,
}

/// GSLB pool definition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DNSPool {
    /// Data server the listeners live on
    pub data_server_name: String,

    /// DNS record type (defaults to the wide-IP record type)
    #[serde(default)]
    pub dns_record_type: String,

    /// Pool load balancing method (defaults to round-robin)
    #[serde(default)]
    pub load_balance_method: String,

    /// Health monitor for the pool members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<DNSMonitor>,
}

/// GSLB pool health monitor
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DNSMonitor {
    /// Monitor type: http, https, tcp or udp
    #[serde(rename = "type")]
    pub type_: String,

    /// Request sent by http/https monitors
    #[serde(default)]
    pub send: String,

    /// Expected response of http/https monitors
    #[serde(default)]
    pub recv: String,

    /// Seconds between checks
    #[serde(default)]
    pub interval: i32,

    /// Seconds before a member is marked down
    #[serde(default)]
    pub timeout: i32,
}
