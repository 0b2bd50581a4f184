//! TransportServer reconciliation.

use super::Reconciler;
use crate::association::associated_transport_servers;
use crate::builder::listener_name;
use crate::error::ControllerError;
use crate::events::{reasons, Severity};
use crate::lease::LeaseStatus;
use crate::resource_config::ResourceType;
use crate::status::update_transport_server_status;
use crate::telemetry::CounterKind;
use crds::TransportServer;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lease key of a TransportServer: `<namespace>/<name>_ts`
pub fn transport_server_key(namespace: &str, name: &str) -> String {
    format!("{}/{}_ts", namespace, name)
}

/// Reject TransportServers that can never be rendered
pub fn validate_transport_server(ts: &TransportServer) -> Result<(), ControllerError> {
    let name = ts.name_any();
    if !(1..=65535).contains(&ts.spec.virtual_server_port) {
        return Err(ControllerError::Validation(format!(
            "TransportServer {} has an out of range port {}",
            name, ts.spec.virtual_server_port
        )));
    }
    if ts.spec.pool.service.is_empty() || ts.spec.pool.service_port <= 0 {
        return Err(ControllerError::Validation(format!(
            "TransportServer {} has a pool without a service or service port",
            name
        )));
    }
    match ts.protocol() {
        "tcp" | "udp" | "sctp" => Ok(()),
        other => Err(ControllerError::Validation(format!(
            "TransportServer {} has unsupported type {:?}",
            name, other
        ))),
    }
}

impl Reconciler {
    /// Render or remove the listener of a TransportServer
    pub(crate) async fn process_transport_server(
        &mut self,
        ts: &Arc<TransportServer>,
        deleted: bool,
    ) -> Result<(), ControllerError> {
        let namespace = ts.namespace().unwrap_or_default();
        let name = ts.name_any();
        if !deleted {
            validate_transport_server(ts)?;
        }

        let all = self.store.transport_servers(&namespace);
        self.telemetry.set(CounterKind::TransportServer, &namespace, all.len());
        let group = associated_transport_servers(ts, &all, deleted);

        let Some(address) = self.transport_server_address(ts, &group, deleted).await? else {
            if deleted {
                self.remove_owned_except(ResourceType::TransportServer, &namespace, &name, &HashSet::new());
            }
            return Ok(());
        };

        let rs_name = listener_name(&ts.spec.virtual_server_name, &address, ts.spec.virtual_server_port);
        let Some(source) = group
            .iter()
            .find(|t| t.name_any() == name)
            .or_else(|| group.last())
            .cloned()
        else {
            if self.resources.remove(&rs_name).is_some() {
                debug!(listener = %rs_name, "Removed listener");
            }
            self.remove_owned_except(ResourceType::TransportServer, &namespace, &name, &HashSet::new());
            return Ok(());
        };

        let result = self.builder().transport_server_config(&source, &group, &address);
        match result {
            Ok(mut rs) => {
                self.fill_pool_members(&mut rs, &namespace);
                let keep = HashSet::from([rs_name.clone()]);
                self.remove_owned_except(ResourceType::TransportServer, &namespace, &name, &keep);
                self.resources.insert(rs_name, rs);
                if !deleted {
                    update_transport_server_status(self.status.as_ref(), ts, &address).await;
                }
                Ok(())
            }
            Err(e) => {
                warn!(listener = %rs_name, error = %e, "Cannot build listener, blanking it");
                self.resources.remove(&rs_name);
                self.record_event(&**ts, Severity::Warning, reasons::LISTENER_ERROR, &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn transport_server_address(
        &self,
        ts: &TransportServer,
        group: &[Arc<TransportServer>],
        deleted: bool,
    ) -> Result<Option<String>, ControllerError> {
        let namespace = ts.namespace().unwrap_or_default();
        let name = ts.name_any();
        let explicit = (!ts.spec.virtual_server_address.is_empty()).then(|| ts.spec.virtual_server_address.clone());
        let previous = ts
            .status
            .as_ref()
            .map(|s| s.vs_address.clone())
            .filter(|a| !a.is_empty());

        if !self.leases.is_enabled() {
            return match explicit {
                Some(address) => Ok(Some(address)),
                None if deleted => Ok(previous),
                None => Err(ControllerError::Validation(format!(
                    "TransportServer {}/{} has no virtualServerAddress and leasing is disabled",
                    namespace, name
                ))),
            };
        }

        let key = transport_server_key(&namespace, &name);
        if deleted && group.is_empty() && explicit.is_none() {
            let released = self.leases.release(&ts.spec.ipam_label, "", &key).await?;
            return Ok(released.or(previous));
        }
        if explicit.is_some() {
            return Ok(explicit);
        }

        match self.leases.request(&ts.spec.ipam_label, "", &key).await? {
            LeaseStatus::Allocated(ip) => Ok(Some(ip)),
            LeaseStatus::Requested => {
                info!(transport_server = %name, namespace = %namespace, "Waiting for address allocation");
                Ok(None)
            }
            LeaseStatus::NotRequested => Err(ControllerError::Transient(format!(
                "allocation for TransportServer {}/{} is present without a request",
                namespace, name
            ))),
            status @ (LeaseStatus::NotEnabled | LeaseStatus::InvalidInput) => {
                debug!(transport_server = %name, %status, "No address lease");
                Ok(None)
            }
        }
    }
}
