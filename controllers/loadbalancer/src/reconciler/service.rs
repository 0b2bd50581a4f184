//! Service, LoadBalancer Service and lease-status handling.
//!
//! Service and Endpoints changes refresh the pool membership cache and fan
//! out to the intent resources that use the Service. LoadBalancer Services
//! get listeners of their own, addressed through the lease object.

use super::ingress_link::ingress_link_key;
use super::transport_server::transport_server_key;
use super::{into_result, merge_error, Reconciler};
use crate::association::{
    host_group_key, ingress_links_for_service, transport_servers_for_service, virtual_servers_for_service,
};
use crate::error::ControllerError;
use crate::lease::LeaseStatus;
use crate::pool_members::{build_pool_members_info, service_key};
use crate::resource_config::ResourceType;
use crate::status::{erase_service_ingress, set_service_ingress, unset_service_ingress};
use crate::telemetry::CounterKind;
use crds::IPAM;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Annotation carrying the lease label of a LoadBalancer Service
pub const IPAM_LABEL_ANNOTATION: &str = "lbops.microscaler.io/ipam-label";

/// Service type handled with leased addresses
pub const LOAD_BALANCER: &str = "LoadBalancer";

/// Lease key of a LoadBalancer Service: `<namespace>/<name>_svc`
pub fn lb_service_key(namespace: &str, name: &str) -> String {
    format!("{}/{}_svc", namespace, name)
}

/// Service type, `ClusterIP` when unset
pub fn service_type(svc: &Service) -> &str {
    svc.spec.as_ref().and_then(|s| s.type_.as_deref()).unwrap_or("ClusterIP")
}

fn service_ingress_ip(svc: &Service) -> Option<String> {
    svc.status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.iter().find_map(|i| i.ip.clone()))
}

impl Reconciler {
    /// Refresh cached membership for one Service
    pub(crate) fn refresh_pool_members(&mut self, svc: &Service, deleted: bool) {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();
        let key = service_key(&namespace, &name);
        if deleted {
            self.pool_members.remove(&key);
            return;
        }
        let endpoints = self.store.endpoints(&namespace, &name);
        let nodes = self.nodes.list_nodes(None);
        let info = build_pool_members_info(svc, endpoints.as_deref(), &nodes);
        debug!(
            service = %name,
            namespace = %namespace,
            ports = info.member_map.len(),
            "Refreshed pool membership"
        );
        self.pool_members.insert(key, info);
    }

    /// Refresh membership and re-render everything backed by the Service
    pub(crate) async fn process_service_change(
        &mut self,
        svc: &Arc<Service>,
        deleted: bool,
    ) -> Result<(), ControllerError> {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();
        self.refresh_pool_members(svc, deleted);

        if service_type(svc) == LOAD_BALANCER {
            return self.process_lb_service(svc, deleted).await;
        }
        if self.initializing {
            return Ok(());
        }

        let mut first = None;
        let virtual_servers = self.store.virtual_servers(&namespace);
        for vs in virtual_servers_for_service(&virtual_servers, &name) {
            merge_error(&mut first, self.process_virtual_server(&vs, false).await);
        }
        let transport_servers = self.store.transport_servers(&namespace);
        for ts in transport_servers_for_service(&transport_servers, &name) {
            merge_error(&mut first, self.process_transport_server(&ts, false).await);
        }
        let ingress_links = self.monitored(|ns| self.store.ingress_links(ns));
        for il in ingress_links_for_service(&ingress_links, svc) {
            merge_error(&mut first, self.process_ingress_link(&il, false).await);
        }
        into_result(first)
    }

    /// Listeners for a LoadBalancer Service, one per service port
    pub(crate) async fn process_lb_service(
        &mut self,
        svc: &Arc<Service>,
        deleted: bool,
    ) -> Result<(), ControllerError> {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();
        if !self.leases.is_enabled() {
            debug!(service = %name, namespace = %namespace, "Leasing disabled, ignoring LoadBalancer Service");
            return Ok(());
        }
        let label = svc.annotations().get(IPAM_LABEL_ANNOTATION).cloned().unwrap_or_default();
        let key = lb_service_key(&namespace, &name);

        if deleted {
            let released = self.leases.release(&label, "", &key).await?;
            if let Some(ip) = released.or_else(|| service_ingress_ip(svc)) {
                unset_service_ingress(self.status.as_ref(), self.events.as_ref(), svc, &ip).await;
            }
            self.remove_owned_except(ResourceType::LoadBalancerService, &namespace, &name, &HashSet::new());
            return Ok(());
        }

        if label.is_empty() {
            return Err(ControllerError::Validation(format!(
                "LoadBalancer Service {}/{} has no {} annotation",
                namespace, name, IPAM_LABEL_ANNOTATION
            )));
        }
        let ip = match self.leases.request(&label, "", &key).await? {
            LeaseStatus::Allocated(ip) => ip,
            LeaseStatus::Requested => {
                info!(service = %name, namespace = %namespace, "Waiting for address allocation");
                return Ok(());
            }
            LeaseStatus::NotRequested => {
                return Err(ControllerError::Transient(format!(
                    "allocation for Service {}/{} is present without a request",
                    namespace, name
                )))
            }
            status @ (LeaseStatus::NotEnabled | LeaseStatus::InvalidInput) => {
                debug!(service = %name, %status, "No address lease");
                return Ok(());
            }
        };

        set_service_ingress(self.status.as_ref(), self.events.as_ref(), svc, &ip).await;

        let ports = svc.spec.as_ref().and_then(|s| s.ports.clone()).unwrap_or_default();
        let mut keep = HashSet::new();
        for port in &ports {
            let mut rs = self.builder().lb_service_config(svc, &ip, port);
            self.fill_pool_members(&mut rs, &namespace);
            let rs_name = rs.virtual_server.name.clone();
            keep.insert(rs_name.clone());
            self.resources.insert(rs_name, rs);
        }
        self.remove_owned_except(ResourceType::LoadBalancerService, &namespace, &name, &keep);
        Ok(())
    }

    /// Fan a lease status change out to every resource holding a lease
    pub(crate) async fn process_ipam(&mut self, ipam: &IPAM) -> Result<(), ControllerError> {
        let ipam_namespace = ipam.namespace().unwrap_or_default();
        let entries = ipam.status.as_ref().map(|s| s.ip_status.clone()).unwrap_or_default();
        let hosts: HashSet<&str> = entries.iter().map(|e| e.host.as_str()).filter(|h| !h.is_empty()).collect();
        let keys: HashSet<&str> = entries.iter().map(|e| e.key.as_str()).filter(|k| !k.is_empty()).collect();
        let mut first = None;

        let virtual_servers: Vec<_> = self
            .monitored(|ns| self.store.virtual_servers(ns))
            .into_iter()
            .filter(|vs| {
                let namespace = vs.namespace().unwrap_or_default();
                (!vs.spec.host.is_empty() && hosts.contains(vs.spec.host.as_str()))
                    || (!vs.spec.host_group.is_empty()
                        && keys.contains(host_group_key(&namespace, &vs.spec.host_group).as_str()))
            })
            .collect();
        self.telemetry
            .set(CounterKind::IpamVirtualServer, &ipam_namespace, virtual_servers.len());
        for vs in virtual_servers {
            merge_error(&mut first, self.process_virtual_server(&vs, false).await);
        }

        let transport_servers: Vec<_> = self
            .monitored(|ns| self.store.transport_servers(ns))
            .into_iter()
            .filter(|ts| {
                keys.contains(transport_server_key(&ts.namespace().unwrap_or_default(), &ts.name_any()).as_str())
            })
            .collect();
        self.telemetry
            .set(CounterKind::IpamTransportServer, &ipam_namespace, transport_servers.len());
        for ts in transport_servers {
            merge_error(&mut first, self.process_transport_server(&ts, false).await);
        }

        let ingress_links: Vec<_> = self
            .monitored(|ns| self.store.ingress_links(ns))
            .into_iter()
            .filter(|il| keys.contains(ingress_link_key(&il.namespace().unwrap_or_default(), &il.name_any()).as_str()))
            .collect();
        for il in ingress_links {
            merge_error(&mut first, self.process_ingress_link(&il, false).await);
        }

        let services: Vec<_> = self
            .monitored(|ns| self.store.services(ns))
            .into_iter()
            .filter(|svc| keys.contains(lb_service_key(&svc.namespace().unwrap_or_default(), &svc.name_any()).as_str()))
            .collect();
        self.telemetry
            .set(CounterKind::IpamLoadBalancerService, &ipam_namespace, services.len());
        for svc in services {
            if service_type(&svc) == LOAD_BALANCER {
                merge_error(&mut first, self.process_lb_service(&svc, false).await);
                continue;
            }
            let namespace = svc.namespace().unwrap_or_default();
            let name = svc.name_any();
            warn!(service = %name, namespace = %namespace, "Service holds a lease but is no longer LoadBalancer type");
            erase_service_ingress(self.status.as_ref(), &svc).await;
            self.remove_owned_except(ResourceType::LoadBalancerService, &namespace, &name, &HashSet::new());
            let label = svc.annotations().get(IPAM_LABEL_ANNOTATION).cloned().unwrap_or_default();
            let released = self.leases.release(&label, "", &lb_service_key(&namespace, &name)).await;
            merge_error(&mut first, released.map(|_| ()).map_err(ControllerError::from));
        }
        into_result(first)
    }
}
