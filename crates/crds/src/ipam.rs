//! IPAM CRD
//!
//! The lease object shared with the external address allocator. The
//! controller writes `spec.hostSpecs`; the allocator answers in
//! `status.ipStatus`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "lbops.microscaler.io",
    version = "v1",
    kind = "IPAM",
    namespaced,
    status = "IPAMStatus"
)]
/// Address requests handed to the external allocator
#[serde(rename_all = "camelCase")]
pub struct IPAMSpec {
    /// Address requests
    #[serde(default)]
    pub host_specs: Vec<HostSpec>,
}

/// One address request, keyed by host or by key
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostSpec {
    /// Host the address is requested for
    #[serde(default)]
    pub host: String,

    /// Resource key when the request is not per host
    #[serde(default)]
    pub key: String,

    /// Allocator label selecting the address range
    pub ipam_label: String,
}

/// Addresses the allocator assigned
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IPAMStatus {
    /// Allocations
    #[serde(default, rename = "IPStatus")]
    pub ip_status: Vec<IPSpec>,
}

/// An allocation written back by the allocator
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IPSpec {
    /// Host the address was assigned to
    #[serde(default)]
    pub host: String,

    /// Resource key the address was assigned to
    #[serde(default)]
    pub key: String,

    /// Label the address was allocated from
    pub ipam_label: String,

    /// Assigned address
    pub ip: String,
}

impl HostSpec {
    /// True when the entry addresses `host` (if non-empty) or else `key`
    pub fn is_for(&self, host: &str, key: &str) -> bool {
        if !host.is_empty() {
            self.host == host
        } else {
            !key.is_empty() && self.key == key
        }
    }
}

impl IPSpec {
    /// True when the allocation addresses `host` (if non-empty) or else `key`
    pub fn is_for(&self, host: &str, key: &str) -> bool {
        if !host.is_empty() {
            self.host == host
        } else {
            !key.is_empty() && self.key == key
        }
    }
}
