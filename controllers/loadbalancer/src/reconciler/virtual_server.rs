//! VirtualServer reconciliation.
//!
//! A VirtualServer is never rendered on its own: the association group it
//! belongs to is resolved first and every listener port is rebuilt from the
//! whole group, so processing any member converges all of them.

use super::{into_result, Reconciler};
use crate::association::{associated_virtual_servers, group_address, group_ipam_label, host_group_key};
use crate::builder::{listener_name, virtual_ports};
use crate::error::ControllerError;
use crate::events::{reasons, Severity};
use crate::lease::LeaseStatus;
use crate::resource_config::ResourceType;
use crate::status::update_virtual_server_status;
use crate::telemetry::CounterKind;
use crds::{VirtualServer, HTTP_TRAFFIC_ALLOW, HTTP_TRAFFIC_NONE, HTTP_TRAFFIC_REDIRECT};
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reject resources that can never produce a listener
pub fn validate_virtual_server(vs: &VirtualServer) -> Result<(), ControllerError> {
    let name = vs.name_any();
    let valid_port = |p: i32| (1..=65535).contains(&p);
    if !valid_port(vs.http_port()) || !valid_port(vs.https_port()) {
        return Err(ControllerError::Validation(format!(
            "VirtualServer {} has an out of range port",
            name
        )));
    }
    match vs.spec.http_traffic.as_str() {
        "" | HTTP_TRAFFIC_NONE | HTTP_TRAFFIC_ALLOW | HTTP_TRAFFIC_REDIRECT => {}
        other => {
            return Err(ControllerError::Validation(format!(
                "VirtualServer {} has unknown httpTraffic {:?}",
                name, other
            )))
        }
    }
    for pool in &vs.spec.pools {
        if pool.service.is_empty() || pool.service_port <= 0 {
            return Err(ControllerError::Validation(format!(
                "VirtualServer {} has a pool without a service or service port",
                name
            )));
        }
    }
    Ok(())
}

/// Lease identity: the hostgroup key when grouped by hostgroup, else the host
pub(crate) fn lease_identity(vs: &VirtualServer, namespace: &str) -> (String, String) {
    if vs.spec.host_group.is_empty() {
        (vs.spec.host.clone(), String::new())
    } else {
        (String::new(), host_group_key(namespace, &vs.spec.host_group))
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Address a VirtualServer is or was served on
fn known_address(vs: &VirtualServer) -> Option<String> {
    non_empty(&vs.spec.virtual_server_address)
        .or_else(|| vs.status.as_ref().and_then(|s| non_empty(&s.vs_address)))
}

impl Reconciler {
    /// Render or remove the listeners of a VirtualServer's group
    pub(crate) async fn process_virtual_server(
        &mut self,
        vs: &Arc<VirtualServer>,
        deleted: bool,
    ) -> Result<(), ControllerError> {
        let namespace = vs.namespace().unwrap_or_default();
        let name = vs.name_any();
        if !deleted {
            validate_virtual_server(vs)?;
        }

        let all = self.store.virtual_servers(&namespace);
        self.telemetry.set(CounterKind::VirtualServer, &namespace, all.len());

        let group = match associated_virtual_servers(vs, &all, self.leases.is_enabled(), deleted) {
            Ok(group) => group,
            Err(e) => {
                warn!(virtual_server = %name, namespace = %namespace, error = %e, "Invalid association group");
                self.blank_conflicting_listeners(vs, &all);
                self.record_event(&**vs, Severity::Warning, reasons::GROUP_CONFLICT, &e.to_string())
                    .await;
                return Err(e);
            }
        };

        let Some(address) = self.virtual_server_address(vs, &group, deleted).await? else {
            if deleted || group.is_empty() {
                self.remove_owned_except(ResourceType::VirtualServer, &namespace, &name, &HashSet::new());
            }
            return Ok(());
        };

        let mut keep = HashSet::new();
        let mut built = Vec::new();
        let mut first_error = None;
        for port in virtual_ports(vs) {
            let rs_name = listener_name(&vs.spec.virtual_server_name, &address, port.port);
            if group.is_empty() || (port.protocol == "http" && !vs.handles_http()) {
                if self.resources.remove(&rs_name).is_some() {
                    debug!(listener = %rs_name, "Removed listener");
                }
                continue;
            }
            let result = self.builder().virtual_server_config(vs, &group, &address, port);
            match result {
                Ok(mut rs) => {
                    if deleted {
                        if let Some(owner) = group.first() {
                            rs.meta.resource_name = owner.name_any();
                        }
                    }
                    self.fill_pool_members(&mut rs, &namespace);
                    keep.insert(rs_name);
                    built.push(rs);
                }
                Err(e) => {
                    warn!(listener = %rs_name, error = %e, "Cannot build listener, blanking it");
                    self.resources.remove(&rs_name);
                    self.record_event(&**vs, Severity::Warning, reasons::LISTENER_ERROR, &e.to_string())
                        .await;
                    first_error.get_or_insert(e);
                }
            }
        }

        self.remove_owned_except(ResourceType::VirtualServer, &namespace, &name, &keep);
        let mut new_hosts = Vec::new();
        for rs in built {
            let rs_name = rs.virtual_server.name.clone();
            if !self.resources.contains_key(&rs_name) {
                new_hosts.extend(rs.meta.hosts.iter().cloned());
            }
            self.resources.insert(rs_name, rs);
        }
        if !new_hosts.is_empty() {
            self.process_associated_external_dns(&new_hosts);
        }

        if !deleted && first_error.is_none() {
            update_virtual_server_status(self.status.as_ref(), vs, &address).await;
        }
        into_result(first_error)
    }

    /// Resolve the listener address of the group. `None` means there is
    /// nothing to render yet (lease pending) or nothing left to remove.
    async fn virtual_server_address(
        &self,
        vs: &VirtualServer,
        group: &[Arc<VirtualServer>],
        deleted: bool,
    ) -> Result<Option<String>, ControllerError> {
        let namespace = vs.namespace().unwrap_or_default();
        let name = vs.name_any();

        if !self.leases.is_enabled() {
            let address = if vs.spec.host_group.is_empty() {
                non_empty(&vs.spec.virtual_server_address)
            } else {
                group_address(group)?.or_else(|| non_empty(&vs.spec.virtual_server_address))
            };
            return match address {
                Some(address) => Ok(Some(address)),
                None if deleted => Ok(known_address(vs)),
                None => Err(ControllerError::Validation(format!(
                    "VirtualServer {}/{} has no virtualServerAddress and leasing is disabled",
                    namespace, name
                ))),
            };
        }

        let (host, key) = lease_identity(vs, &namespace);
        if deleted && group.is_empty() && vs.spec.virtual_server_address.is_empty() {
            let released = self.leases.release(&vs.spec.ipam_label, &host, &key).await?;
            return Ok(released.or_else(|| known_address(vs)));
        }
        if let Some(address) = non_empty(&vs.spec.virtual_server_address) {
            return Ok(Some(address));
        }
        if let Some(address) = group_address(group)? {
            return Ok(Some(address));
        }

        let label = group_ipam_label(group);
        match self.leases.request(&label, &host, &key).await? {
            LeaseStatus::Allocated(ip) => Ok(Some(ip)),
            LeaseStatus::Requested => {
                info!(virtual_server = %name, namespace = %namespace, label = %label, "Waiting for address allocation");
                Ok(None)
            }
            LeaseStatus::NotRequested => Err(ControllerError::Transient(format!(
                "allocation for VirtualServer {}/{} is present without a request",
                namespace, name
            ))),
            status @ (LeaseStatus::NotEnabled | LeaseStatus::InvalidInput) => {
                debug!(virtual_server = %name, %status, "No address lease");
                Ok(None)
            }
        }
    }

    /// A conflicting group renders nothing: drop every listener its members
    /// are or were served on
    fn blank_conflicting_listeners(&mut self, vs: &VirtualServer, all: &[Arc<VirtualServer>]) {
        let same_group = |other: &VirtualServer| {
            if vs.spec.host_group.is_empty() {
                other.spec.host_group.is_empty() && other.spec.host == vs.spec.host
            } else {
                other.spec.host_group == vs.spec.host_group
            }
        };
        let mut names = Vec::new();
        for member in all.iter().map(|m| &**m).filter(|m| same_group(m)).chain(std::iter::once(vs)) {
            let Some(address) = known_address(member) else {
                continue;
            };
            for port in virtual_ports(member) {
                names.push(listener_name(&member.spec.virtual_server_name, &address, port.port));
            }
        }
        for rs_name in names {
            if self.resources.remove(&rs_name).is_some() {
                info!(listener = %rs_name, "Blanked listener of conflicting group");
            }
        }
    }
}
