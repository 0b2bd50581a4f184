//! Shared pool and monitor types
//!
//! Used by VirtualServer and TransportServer to reference backend services.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Backend pool reference
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    /// Request path routed to this pool (VirtualServer only)
    #[serde(default)]
    pub path: String,

    /// Name of the backing Service in the same namespace
    pub service: String,

    /// Service port the pool forwards to
    pub service_port: i32,

    /// Node label selector restricting node-port members (e.g. "pool=edge")
    #[serde(default)]
    pub node_member_label: String,

    /// Health monitor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<Monitor>,

    /// Path rewrite target
    #[serde(default)]
    pub rewrite: String,
}

/// Health monitor definition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Monitor {
    /// Monitor type (http, https, tcp, udp)
    #[serde(rename = "type")]
    pub type_: String,

    /// Request string (http/https only)
    #[serde(default)]
    pub send: String,

    /// Expected response (http/https only)
    #[serde(default)]
    pub recv: String,

    /// Probe interval in seconds
    #[serde(default)]
    pub interval: i32,

    /// Probe timeout in seconds
    #[serde(default)]
    pub timeout: i32,
}
