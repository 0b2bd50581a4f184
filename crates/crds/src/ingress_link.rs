//! IngressLink CRD
//!
//! Exposes an in-cluster ingress controller (selected by labels) on a
//! virtual address, one listener per service port.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "lbops.microscaler.io",
    version = "v1",
    kind = "IngressLink",
    namespaced,
    status = "IngressLinkStatus",
    shortname = "il"
)]
/// Listeners in front of an in-cluster ingress controller
#[serde(rename_all = "camelCase")]
pub struct IngressLinkSpec {
    /// Explicit virtual address (takes priority over ipamLabel)
    #[serde(default)]
    pub virtual_server_address: String,

    /// Lease label used to request an address from the IPAM allocator
    #[serde(default)]
    pub ipam_label: String,

    /// Host (informational, used for DNS matching)
    #[serde(default)]
    pub host: String,

    /// Selects the ingress controller Service
    pub selector: LabelSelector,

    /// iRules attached to every generated listener
    #[serde(default)]
    pub i_rules: Vec<String>,
}

/// Equality-based label selector
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Labels the ingress controller Service must carry
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// True when every selector label is present with the same value
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.match_labels.is_empty()
            && self
                .match_labels
                .iter()
                .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
    }
}

/// Observed state of an IngressLink
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngressLinkStatus {
    /// Address the listeners are bound to
    #[serde(default)]
    pub vs_address: String,
}
