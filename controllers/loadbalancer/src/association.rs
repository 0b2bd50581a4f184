//! Association resolver.
//!
//! Resources of one kind that share a listener form a group: VirtualServers
//! by hostgroup, else by host, else by explicit address; TransportServers by
//! address and port. Addressing conflicts invalidate the whole group; port
//! and path conflicts only drop the offending member.

use crate::error::ControllerError;
use crds::{IngressLink, TransportServer, VirtualServer};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Group members for `current`, in store order.
///
/// `all` is every VirtualServer of the namespace. When `deleted` is set the
/// current resource itself is left out so its siblings can be re-rendered.
pub fn associated_virtual_servers(
    current: &VirtualServer,
    all: &[Arc<VirtualServer>],
    ipam_enabled: bool,
    deleted: bool,
) -> Result<Vec<Arc<VirtualServer>>, ControllerError> {
    let current_name = current.name_any();
    let mut candidates: Vec<Arc<VirtualServer>> = all.to_vec();
    if !deleted && !candidates.iter().any(|vs| vs.name_any() == current_name) {
        candidates.push(Arc::new(current.clone()));
    }

    let mut group = Vec::new();
    let mut seen_paths: HashSet<(String, String)> = HashSet::new();

    for vs in candidates {
        let name = vs.name_any();
        if deleted && name == current_name {
            continue;
        }
        if vs.spec.host_group != current.spec.host_group {
            continue;
        }
        if current.spec.host_group.is_empty() {
            if vs.spec.host != current.spec.host {
                continue;
            }
            if vs.spec.virtual_server_address != current.spec.virtual_server_address {
                if current.spec.host.is_empty() {
                    continue;
                }
                return Err(ControllerError::Conflict(format!(
                    "VirtualServers {} and {} serve host {} on different addresses ({} and {})",
                    current_name,
                    name,
                    current.spec.host,
                    current.spec.virtual_server_address,
                    vs.spec.virtual_server_address
                )));
            }
        }
        if ipam_enabled {
            if vs.spec.ipam_label != current.spec.ipam_label {
                return Err(ControllerError::Conflict(format!(
                    "VirtualServers {} and {} request different lease labels ({} and {})",
                    current_name, name, current.spec.ipam_label, vs.spec.ipam_label
                )));
            }
            if vs.spec.host.is_empty() && !vs.spec.ipam_label.is_empty() {
                return Err(ControllerError::Conflict(format!(
                    "VirtualServer {} has a lease label but no host",
                    name
                )));
            }
        }
        if vs.http_port() != current.http_port() || vs.https_port() != current.https_port() {
            warn!(
                virtual_server = %name,
                "Port override differs from {}, excluding from group", current_name
            );
            continue;
        }

        // A path repeated within the member itself is as ambiguous as one
        // repeated across members
        let mut paths: HashSet<(String, String)> = HashSet::new();
        let duplicate = vs.spec.pools.iter().find_map(|p| {
            let entry = (vs.spec.host.clone(), p.path.clone());
            (seen_paths.contains(&entry) || !paths.insert(entry.clone())).then_some(entry)
        });
        if let Some((host, path)) = duplicate {
            warn!(
                virtual_server = %name,
                "Path {} for host {} is already served in this group, excluding", path, host
            );
            continue;
        }
        seen_paths.extend(paths);
        group.push(vs);
    }

    debug!(
        virtual_server = %current_name,
        members = group.len(),
        "Resolved association group"
    );
    Ok(group)
}

/// Lease label shared by the group
pub fn group_ipam_label(group: &[Arc<VirtualServer>]) -> String {
    group
        .iter()
        .map(|vs| vs.spec.ipam_label.as_str())
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Explicit address shared by the group, if any
pub fn group_address(group: &[Arc<VirtualServer>]) -> Result<Option<String>, ControllerError> {
    let mut address: Option<&str> = None;
    for vs in group {
        let a = vs.spec.virtual_server_address.as_str();
        if a.is_empty() {
            continue;
        }
        match address {
            Some(existing) if existing != a => {
                return Err(ControllerError::Conflict(format!(
                    "group members specify different addresses ({} and {})",
                    existing, a
                )));
            }
            _ => address = Some(a),
        }
    }
    Ok(address.map(str::to_string))
}

/// Lease key of a hostgroup: `<namespace>/<hostGroup>`
pub fn host_group_key(namespace: &str, host_group: &str) -> String {
    format!("{}/{}", namespace, host_group)
}

/// TransportServers sharing a listener with `current`.
///
/// Only resources with an explicit address share; a leased one always
/// forms its own group.
pub fn associated_transport_servers(
    current: &TransportServer,
    all: &[Arc<TransportServer>],
    deleted: bool,
) -> Vec<Arc<TransportServer>> {
    let current_name = current.name_any();
    let address = &current.spec.virtual_server_address;
    let mut group: Vec<Arc<TransportServer>> = all
        .iter()
        .filter(|ts| {
            if ts.name_any() == current_name {
                return !deleted;
            }
            !address.is_empty()
                && ts.spec.virtual_server_address == *address
                && ts.spec.virtual_server_port == current.spec.virtual_server_port
        })
        .cloned()
        .collect();
    if !deleted && !group.iter().any(|ts| ts.name_any() == current_name) {
        group.push(Arc::new(current.clone()));
    }
    group
}

/// VirtualServers with a pool backed by `service`
pub fn virtual_servers_for_service(all: &[Arc<VirtualServer>], service: &str) -> Vec<Arc<VirtualServer>> {
    all.iter()
        .filter(|vs| vs.spec.pools.iter().any(|p| p.service == service))
        .cloned()
        .collect()
}

/// TransportServers backed by `service`
pub fn transport_servers_for_service(all: &[Arc<TransportServer>], service: &str) -> Vec<Arc<TransportServer>> {
    all.iter()
        .filter(|ts| ts.spec.pool.service == service)
        .cloned()
        .collect()
}

/// IngressLinks whose selector picks `service`
pub fn ingress_links_for_service(all: &[Arc<IngressLink>], service: &Service) -> Vec<Arc<IngressLink>> {
    let labels = service.labels();
    all.iter()
        .filter(|il| il.spec.selector.matches(labels))
        .cloned()
        .collect()
}

/// VirtualServers referencing Policy `policy`
pub fn virtual_servers_for_policy(all: &[Arc<VirtualServer>], policy: &str) -> Vec<Arc<VirtualServer>> {
    all.iter()
        .filter(|vs| vs.spec.policy_name == policy)
        .cloned()
        .collect()
}

/// TransportServers referencing Policy `policy`
pub fn transport_servers_for_policy(all: &[Arc<TransportServer>], policy: &str) -> Vec<Arc<TransportServer>> {
    all.iter()
        .filter(|ts| ts.spec.policy_name == policy)
        .cloned()
        .collect()
}

/// VirtualServers terminating TLS with TLSProfile `profile`
pub fn virtual_servers_for_tls_profile(all: &[Arc<VirtualServer>], profile: &str) -> Vec<Arc<VirtualServer>> {
    all.iter()
        .filter(|vs| vs.spec.tls_profile_name == profile)
        .cloned()
        .collect()
}
