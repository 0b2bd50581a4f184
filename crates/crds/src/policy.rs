//! Policy CRD
//!
//! Shared listener settings (profiles, SNAT, WAF, iRules) referenced by name
//! from VirtualServers and TransportServers.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "lbops.microscaler.io",
    version = "v1",
    kind = "Policy",
    namespaced,
    shortname = "plc"
)]
/// Traffic settings shared by the listeners that reference the Policy
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// HTTP-level settings
    #[serde(default)]
    pub l7_policies: L7Policy,

    /// Network-level settings
    #[serde(default)]
    pub l3_policies: L3Policy,

    /// iRules to attach
    #[serde(default)]
    pub i_rules: PolicyIRules,

    /// Profiles to attach
    #[serde(default)]
    pub profiles: PolicyProfiles,

    /// SNAT mode or pool name
    #[serde(default)]
    pub snat: String,
}

/// HTTP-level policy settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct L7Policy {
    /// WAF policy reference
    #[serde(default)]
    pub waf: String,
}

/// Network-level policy settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct L3Policy {
    /// VLANs the listener accepts traffic on
    #[serde(default)]
    pub allow_vlans: Vec<String>,

    /// Client source ranges the listener accepts
    #[serde(default)]
    pub allow_source_range: Vec<String>,
}

/// iRules attached by a Policy
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyIRules {
    /// iRule applied to secure listeners
    #[serde(default)]
    pub secure: String,

    /// iRule applied to insecure listeners
    #[serde(default)]
    pub insecure: String,
}

/// Device profiles attached by a Policy
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyProfiles {
    /// TCP profile
    #[serde(default)]
    pub tcp: String,

    /// UDP profile
    #[serde(default)]
    pub udp: String,

    /// HTTP profile
    #[serde(default)]
    pub http: String,

    /// Persistence profile
    #[serde(default)]
    pub persistence_profile: String,

    /// Logging profiles
    #[serde(default)]
    pub log_profiles: Vec<String>,
}
