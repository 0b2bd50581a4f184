//! Generated listener artifacts.
//!
//! A [`ResourceConfig`] is everything the downstream device needs for one
//! listener. All collections are ordered so two artifacts built from the
//! same inputs serialize to identical bytes.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Session state given to every generated pool member
pub const MEMBER_SESSION_ENABLED: &str = "user-enabled";

/// Generated listeners keyed by name
pub type ResourceMap = BTreeMap<String, ResourceConfig>;

/// Wide-IPs keyed by domain name
pub type DnsConfig = BTreeMap<String, WideIP>;

/// Kind of intent resource that produced an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum ResourceType {
    #[default]
    VirtualServer,
    TransportServer,
    IngressLink,
    LoadBalancerService,
}

/// Bookkeeping that is not sent downstream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaData {
    pub resource_type: ResourceType,
    pub namespace: String,
    pub resource_name: String,
    /// http, https, tcp or udp
    pub protocol: String,
    pub hosts: Vec<String>,
    /// At least one pool has members
    pub active: bool,
}

/// Reference to a device profile
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRef {
    pub name: String,
    pub partition: String,
    /// clientside, serverside or all
    pub context: String,
}

/// The device virtual server of a listener
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Virtual {
    pub name: String,
    pub partition: String,
    pub destination_address: String,
    pub port: i32,
    pub ip_protocol: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub snat: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub waf: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pool_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub persistence_profile: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub http_traffic: String,
    pub is_secure: bool,
    pub translate_server_address: bool,
    pub translate_server_port: bool,
    pub irules: Vec<String>,
    pub allow_vlans: Vec<String>,
    pub allow_source_range: Vec<String>,
    pub log_profiles: Vec<String>,
    pub profiles: BTreeSet<ProfileRef>,
}

impl Virtual {
    /// Set the destination address and port
    pub fn set_address(&mut self, address: &str, port: i32) {
        self.destination_address = address.to_string();
        self.port = port;
    }
}

/// A backend address of a pool
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMember {
    pub address: String,
    pub port: i32,
    pub session: String,
}

impl PoolMember {
    /// Enabled member at address:port
    pub fn new(address: impl Into<String>, port: i32) -> Self {
        Self {
            address: address.into(),
            port,
            session: MEMBER_SESSION_ENABLED.to_string(),
        }
    }
}

/// Backend pool for one service port
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub name: String,
    pub partition: String,
    pub service_name: String,
    pub service_port: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub node_member_label: String,
    pub members: Vec<PoolMember>,
    pub monitor_names: Vec<String>,
}

/// Health monitor of a pool
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Monitor {
    pub name: String,
    pub partition: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub interval: i32,
    pub timeout: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub send: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub recv: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,
}

/// One L7 forwarding rule: requests for host+path go to a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    pub name: String,
    pub host: String,
    pub path: String,
    pub pool: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rewrite: String,
}

/// L7 policy attached to a listener
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyFragment {
    pub name: String,
    pub partition: String,
    pub rules: Vec<ForwardingRule>,
}

/// iRule attached to a listener
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IRule {
    pub name: String,
    pub partition: String,
    pub code: String,
}

/// Key/value data group read by iRules
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataGroup {
    pub name: String,
    pub partition: String,
    pub records: BTreeMap<String, String>,
}

/// Identity of a TLS profile built from a Secret
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKey {
    pub name: String,
    pub resource_name: String,
}

/// A client or server SSL profile built from a Secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomProfile {
    pub name: String,
    pub partition: String,
    /// clientside or serverside
    pub context: String,
    pub cert: String,
    pub key: String,
    pub server_name: String,
    pub sni_default: bool,
}

/// Everything generated for one listener
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    #[serde(rename = "virtual")]
    pub virtual_server: Virtual,
    pub pools: Vec<Pool>,
    pub monitors: Vec<Monitor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyFragment>,
    pub irules: BTreeMap<String, IRule>,
    pub data_groups: BTreeMap<String, DataGroup>,
    #[serde(skip)]
    pub custom_profiles: BTreeMap<SecretKey, CustomProfile>,
    #[serde(skip)]
    pub meta: MetaData,
}

impl ResourceConfig {
    /// An enabled listener at address:port in the given partition
    pub fn new(name: &str, partition: &str, address: &str, port: i32, resource_type: ResourceType) -> Self {
        let mut rs = ResourceConfig::default();
        rs.virtual_server.name = name.to_string();
        rs.virtual_server.partition = partition.to_string();
        rs.virtual_server.enabled = true;
        rs.virtual_server.set_address(address, port);
        rs.meta.resource_type = resource_type;
        rs
    }

    /// True when the artifact was generated for namespace/name
    pub fn is_owned_by(&self, resource_type: ResourceType, namespace: &str, name: &str) -> bool {
        self.meta.resource_type == resource_type
            && self.meta.namespace == namespace
            && self.meta.resource_name == name
    }

    /// Pool by name
    pub fn pool_mut(&mut self, name: &str) -> Option<&mut Pool> {
        self.pools.iter_mut().find(|p| p.name == name)
    }

    /// True when a monitor of that name exists
    pub fn has_monitor(&self, name: &str) -> bool {
        self.monitors.iter().any(|m| m.name == name)
    }

    /// Record a served host once
    pub fn add_host(&mut self, host: &str) {
        if !host.is_empty() && !self.meta.hosts.iter().any(|h| h == host) {
            self.meta.hosts.push(host.to_string());
        }
    }
}

/// GSLB pool of listeners behind a wide-IP
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GslbPool {
    pub name: String,
    pub record_type: String,
    pub lb_method: String,
    pub members: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<Monitor>,
}

/// DNS load-balancing record for one domain
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WideIP {
    pub domain_name: String,
    pub record_type: String,
    pub lb_method: String,
    pub pools: Vec<GslbPool>,
}

/// Replaces characters the device rejects in object names
pub fn format_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | ':' | '/' | '-' | '%' | '=' => '_',
            other => other,
        })
        .collect()
}

/// `crd_<ip>_<port>`
pub fn virtual_server_name(address: &str, port: i32) -> String {
    format_name(&format!("crd_{}_{}", address, port))
}

/// `<name>_<port>` for an explicit listener name
pub fn custom_virtual_server_name(name: &str, port: i32) -> String {
    format_name(&format!("{}_{}", name, port))
}

/// `<service>_<port>_<namespace>[_<node label>]`
pub fn pool_name(namespace: &str, service: &str, port: i32, node_member_label: &str) -> String {
    let name = if node_member_label.is_empty() {
        format!("{}_{}_{}", service, port, namespace)
    } else {
        format!("{}_{}_{}_{}", service, port, namespace, node_member_label)
    };
    format_name(&name)
}

/// Monitor name of a pool
pub fn monitor_name(pool: &str) -> String {
    format!("{}_monitor", pool)
}

/// Listener for a LoadBalancer Service port
pub fn lb_service_name(namespace: &str, name: &str, address: &str, port: i32) -> String {
    format_name(&format!("vs_lb_svc_{}_{}_{}_{}", namespace, name, address, port))
}

/// Listener for an IngressLink port
pub fn ingress_link_name(address: &str, port: i32) -> String {
    format!("ingress_link_{}", virtual_server_name(address, port))
}
