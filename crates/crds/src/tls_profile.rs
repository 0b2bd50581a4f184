//! TLSProfile CRD
//!
//! TLS termination settings for the hosts a VirtualServer serves.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Terminate client TLS on the listener
pub const TLS_EDGE: &str = "edge";
/// Terminate client TLS and re-encrypt towards the pool
pub const TLS_REENCRYPT: &str = "reencrypt";
/// Pass TLS through to the pool untouched
pub const TLS_PASSTHROUGH: &str = "passthrough";

/// `reference` value: profiles already present on the device
pub const TLS_REFERENCE_BIGIP: &str = "bigip";
/// `reference` value: profiles built from Kubernetes Secrets
pub const TLS_REFERENCE_SECRET: &str = "secret";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "lbops.microscaler.io",
    version = "v1",
    kind = "TLSProfile",
    namespaced,
    shortname = "tls"
)]
/// TLS termination for a set of hosts
#[serde(rename_all = "camelCase")]
pub struct TLSProfileSpec {
    /// Hosts this profile may be used for (wildcards allowed, e.g. "*.example.com")
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Termination settings
    pub tls: TLS,
}

/// Termination mode and the profiles it uses
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TLS {
    /// edge, reencrypt or passthrough
    pub termination: String,

    /// Client-side SSL profile (or Secret) name
    #[serde(default, rename = "clientSSL")]
    pub client_ssl: String,

    /// Server-side SSL profile (or Secret) name, reencrypt only
    #[serde(default, rename = "serverSSL")]
    pub server_ssl: String,

    /// bigip or secret
    #[serde(default)]
    pub reference: String,
}

impl TLSProfile {
    /// True when the profile accepts `host`, honouring one wildcard label
    pub fn matches_host(&self, host: &str) -> bool {
        self.spec.hosts.iter().any(|h| host_matches(h, host))
    }
}

/// Matches `host` against `pattern`; `*.example.com` matches `a.example.com`
/// but neither `example.com` nor `a.b.example.com`.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern == host {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix,
            None => false,
        },
        None => false,
    }
}
