//! IngressLink reconciliation.
//!
//! An IngressLink exposes the ingress controller Service chosen by its label
//! selector, one listener per service port.

use super::Reconciler;
use crate::builder::NGINX_MONITOR_PORT;
use crate::config::PoolMemberType;
use crate::error::ControllerError;
use crate::lease::LeaseStatus;
use crate::pool_members::node_port;
use crate::resource_config::ResourceType;
use crate::status::update_ingress_link_status;
use crate::store::creation_order;
use crate::telemetry::CounterKind;
use crds::IngressLink;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Lease key of an IngressLink: `<namespace>/<name>_il`
pub fn ingress_link_key(namespace: &str, name: &str) -> String {
    format!("{}/{}_il", namespace, name)
}

impl Reconciler {
    /// Oldest Service in scope matching the selector
    fn ingress_link_service(&self, il: &IngressLink) -> Option<Arc<Service>> {
        let mut matching: Vec<Arc<Service>> = self
            .monitored(|ns| self.store.services(ns))
            .into_iter()
            .filter(|svc| il.spec.selector.matches(svc.labels()))
            .collect();
        matching.sort_by(|a, b| creation_order(&a.metadata, &b.metadata));
        matching.into_iter().next()
    }

    /// Listeners for an IngressLink, one per ingress controller port
    pub(crate) async fn process_ingress_link(
        &mut self,
        il: &Arc<IngressLink>,
        deleted: bool,
    ) -> Result<(), ControllerError> {
        let namespace = il.namespace().unwrap_or_default();
        let name = il.name_any();
        if !deleted && il.spec.selector.match_labels.is_empty() {
            return Err(ControllerError::Validation(format!(
                "IngressLink {}/{} has an empty selector",
                namespace, name
            )));
        }

        let address = self.ingress_link_address(il, deleted).await?;
        if deleted {
            self.remove_owned_except(ResourceType::IngressLink, &namespace, &name, &HashSet::new());
            self.telemetry.decrement(CounterKind::IngressLink, &namespace);
            return Ok(());
        }
        self.telemetry
            .set(CounterKind::IngressLink, &namespace, self.store.ingress_links(&namespace).len());

        let Some(address) = address else {
            return Ok(());
        };
        let Some(svc) = self.ingress_link_service(il) else {
            info!(ingress_link = %name, namespace = %namespace, "No Service matches the selector");
            self.remove_owned_except(ResourceType::IngressLink, &namespace, &name, &HashSet::new());
            return Ok(());
        };

        let svc_namespace = svc.namespace().unwrap_or_default();
        let ports = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.clone())
            .unwrap_or_default();
        let monitor_port = match self.config.pool_member_type {
            PoolMemberType::NodePort => node_port(&ports, NGINX_MONITOR_PORT).unwrap_or_else(|| {
                error!(service = %svc.name_any(), "No node port for the ingress controller readiness port");
                0
            }),
            PoolMemberType::Cluster => NGINX_MONITOR_PORT,
        };

        let mut keep = HashSet::new();
        for port in ports.iter().filter(|p| p.port != NGINX_MONITOR_PORT) {
            let mut rs = self.builder().ingress_link_config(il, &svc, &address, port, monitor_port);
            self.fill_pool_members(&mut rs, &svc_namespace);
            let rs_name = rs.virtual_server.name.clone();
            debug!(listener = %rs_name, ingress_link = %name, "Built IngressLink listener");
            keep.insert(rs_name.clone());
            self.resources.insert(rs_name, rs);
        }
        self.remove_owned_except(ResourceType::IngressLink, &namespace, &name, &keep);

        update_ingress_link_status(self.status.as_ref(), il, &address).await;
        Ok(())
    }

    async fn ingress_link_address(&self, il: &IngressLink, deleted: bool) -> Result<Option<String>, ControllerError> {
        let namespace = il.namespace().unwrap_or_default();
        let name = il.name_any();
        let explicit = (!il.spec.virtual_server_address.is_empty()).then(|| il.spec.virtual_server_address.clone());

        if !self.leases.is_enabled() {
            return match explicit {
                Some(address) => Ok(Some(address)),
                None if deleted => Ok(None),
                None => Err(ControllerError::Validation(format!(
                    "IngressLink {}/{} has no virtualServerAddress and leasing is disabled",
                    namespace, name
                ))),
            };
        }

        let key = ingress_link_key(&namespace, &name);
        if deleted {
            if explicit.is_some() {
                return Ok(explicit);
            }
            return Ok(self.leases.release(&il.spec.ipam_label, "", &key).await?);
        }
        if explicit.is_some() {
            return Ok(explicit);
        }
        match self.leases.request(&il.spec.ipam_label, "", &key).await? {
            LeaseStatus::Allocated(ip) => Ok(Some(ip)),
            LeaseStatus::Requested => {
                info!(ingress_link = %name, namespace = %namespace, "Waiting for address allocation");
                Ok(None)
            }
            LeaseStatus::NotRequested => Err(ControllerError::Transient(format!(
                "allocation for IngressLink {}/{} is present without a request",
                namespace, name
            ))),
            status @ (LeaseStatus::NotEnabled | LeaseStatus::InvalidInput) => {
                debug!(ingress_link = %name, %status, "No address lease");
                Ok(None)
            }
        }
    }
}
