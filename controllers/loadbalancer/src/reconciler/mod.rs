//! Reconciliation of intent resources into listener artifacts.
//!
//! The reconciler owns all generated state (the listener map, the wide-IP
//! map and the pool membership cache). It is driven by a single worker, so
//! handlers take `&mut self` and never lock.
//!
//! Handlers are organized by intent kind:
//! - `virtual_server`: grouped L7 listeners
//! - `transport_server`: L4 listeners
//! - `ingress_link`: listeners in front of the ingress controller
//! - `external_dns`: wide-IPs over the current listeners
//! - `service`: pool membership, LoadBalancer Services and lease fan-out

pub mod external_dns;
pub mod ingress_link;
pub mod service;
pub mod transport_server;
pub mod virtual_server;

#[cfg(test)]
mod service_test;
#[cfg(test)]
mod virtual_server_test;

use self::service::{service_type, LOAD_BALANCER};
use self::transport_server::transport_server_key;
use self::virtual_server::lease_identity;
use crate::association::{
    transport_servers_for_policy, virtual_servers_for_policy, virtual_servers_for_tls_profile,
};
use crate::builder::ConfigBuilder;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::{EventRecorder, Severity};
use crate::lease::LeaseManager;
use crate::pool_members::{update_pool_members, PoolMembersCache};
use crate::resource::{Resource, ResourceKind, WorkItem};
use crate::resource_config::{DnsConfig, ResourceConfig, ResourceMap, ResourceType};
use crate::status::StatusWriter;
use crate::store::{NodeCache, ResourceStore};
use crate::telemetry::Telemetry;
use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Reconcile core shared by every handler
pub struct Reconciler {
    config: ControllerConfig,
    store: Arc<dyn ResourceStore>,
    nodes: Arc<dyn NodeCache>,
    leases: LeaseManager,
    status: Arc<dyn StatusWriter>,
    events: Arc<dyn EventRecorder>,
    telemetry: Arc<Telemetry>,
    resources: ResourceMap,
    dns_config: DnsConfig,
    pool_members: PoolMembersCache,
    namespaces: BTreeSet<String>,
    initializing: bool,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("partition", &self.config.partition)
            .field("listeners", &self.resources.len())
            .field("wide_ips", &self.dns_config.len())
            .field("namespaces", &self.namespaces)
            .finish_non_exhaustive()
    }
}

/// Keeps the first retryable error of a fan-out, else the first error
fn merge_error(first: &mut Option<ControllerError>, result: Result<(), ControllerError>) {
    let Err(e) = result else {
        return;
    };
    match first {
        Some(existing) if existing.is_retryable() || !e.is_retryable() => {
            debug!(error = %e, "Additional fan-out failure");
        }
        _ => *first = Some(e),
    }
}

fn into_result(first: Option<ControllerError>) -> Result<(), ControllerError> {
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

impl Reconciler {
    /// Reconciler with empty generated state
    #[allow(clippy::too_many_arguments, reason = "one handle per collaborator")]
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn ResourceStore>,
        nodes: Arc<dyn NodeCache>,
        leases: LeaseManager,
        status: Arc<dyn StatusWriter>,
        events: Arc<dyn EventRecorder>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            config,
            store,
            nodes,
            leases,
            status,
            events,
            telemetry,
            resources: ResourceMap::new(),
            dns_config: DnsConfig::new(),
            pool_members: PoolMembersCache::new(),
            namespaces: BTreeSet::new(),
            initializing: false,
        }
    }

    /// Generated listener artifacts
    pub fn resources(&self) -> &ResourceMap {
        &self.resources
    }

    /// Generated wide-IPs
    pub fn dns_config(&self) -> &DnsConfig {
        &self.dns_config
    }

    /// While set, Service changes refresh membership without fanning out
    pub fn set_initializing(&mut self, initializing: bool) {
        self.initializing = initializing;
    }

    /// True when work for `namespace` should be processed
    pub fn in_scope(&self, namespace: &str) -> bool {
        if self.config.namespace_label.is_some() {
            return self.namespaces.contains(namespace);
        }
        match &self.config.watch_namespace {
            Some(ns) => ns == namespace,
            None => true,
        }
    }

    /// Applies `list` to every namespace in scope
    fn monitored<T>(&self, list: impl Fn(&str) -> Vec<Arc<T>>) -> Vec<Arc<T>> {
        if self.config.namespace_label.is_some() {
            return self.namespaces.iter().flat_map(|ns| list(ns)).collect();
        }
        list(self.config.watch_namespace.as_deref().unwrap_or(""))
    }

    fn builder(&self) -> ConfigBuilder<'_> {
        ConfigBuilder::new(self.store.as_ref(), &self.config.partition)
    }

    fn fill_pool_members(&self, rs: &mut ResourceConfig, namespace: &str) {
        update_pool_members(
            rs,
            namespace,
            &self.pool_members,
            self.config.pool_member_type,
            self.nodes.as_ref(),
        );
    }

    async fn record_event<K>(&self, obj: &K, severity: Severity, reason: &str, message: &str)
    where
        K: kube::Resource<DynamicType = ()>,
    {
        let object = obj.object_ref(&());
        self.events.record(&object, severity, reason, message).await;
    }

    /// Drop artifacts owned by a resource that are not in `keep`
    fn remove_owned_except(
        &mut self,
        resource_type: ResourceType,
        namespace: &str,
        name: &str,
        keep: &HashSet<String>,
    ) {
        self.resources.retain(|rs_name, rs| {
            let stale = rs.is_owned_by(resource_type, namespace, name) && !keep.contains(rs_name);
            if stale {
                debug!(listener = %rs_name, "Removing stale listener of {}/{}", namespace, name);
            }
            !stale
        });
    }

    /// Process one work item
    pub async fn reconcile(&mut self, item: &WorkItem) -> Result<(), ControllerError> {
        let deleted = item.delete;
        match &item.resource {
            Resource::VirtualServer(vs) => self.process_virtual_server(vs, deleted).await,
            Resource::TransportServer(ts) => self.process_transport_server(ts, deleted).await,
            Resource::IngressLink(il) => self.process_ingress_link(il, deleted).await,
            Resource::ExternalDns(edns) => {
                self.process_external_dns(edns, deleted);
                Ok(())
            }
            Resource::Policy(policy) => {
                let namespace = policy.namespace().unwrap_or_default();
                let name = policy.name_any();
                let mut first = None;
                let virtual_servers = self.store.virtual_servers(&namespace);
                for vs in virtual_servers_for_policy(&virtual_servers, &name) {
                    merge_error(&mut first, self.process_virtual_server(&vs, false).await);
                }
                let transport_servers = self.store.transport_servers(&namespace);
                for ts in transport_servers_for_policy(&transport_servers, &name) {
                    merge_error(&mut first, self.process_transport_server(&ts, false).await);
                }
                into_result(first)
            }
            Resource::TlsProfile(profile) => {
                let namespace = profile.namespace().unwrap_or_default();
                let name = profile.name_any();
                let mut first = None;
                let virtual_servers = self.store.virtual_servers(&namespace);
                for vs in virtual_servers_for_tls_profile(&virtual_servers, &name) {
                    merge_error(&mut first, self.process_virtual_server(&vs, false).await);
                }
                into_result(first)
            }
            Resource::Service(svc) => self.process_service_change(svc, deleted).await,
            Resource::Endpoints(ep) => {
                let namespace = ep.namespace().unwrap_or_default();
                match self.store.service(&namespace, &ep.name_any()) {
                    Some(svc) => self.process_service_change(&svc, false).await,
                    None => {
                        debug!(endpoints = %ep.name_any(), namespace = %namespace, "No Service for Endpoints");
                        Ok(())
                    }
                }
            }
            Resource::Namespace(ns) => self.process_namespace(ns, deleted).await,
            Resource::Ipam(ipam) => self.process_ipam(ipam).await,
        }
    }

    /// Track namespace scope; a deleted namespace takes its listeners with it
    async fn process_namespace(&mut self, ns: &Namespace, deleted: bool) -> Result<(), ControllerError> {
        let name = ns.name_any();
        if !deleted {
            if !self.namespaces.insert(name.clone()) {
                return Ok(());
            }
            info!(namespace = %name, "Namespace added to scope");
            let result = self.replay_namespace(&name).await;
            if result.as_ref().is_err_and(ControllerError::is_retryable) {
                // Replayed again when the retried item re-adds it
                self.namespaces.remove(&name);
            }
            return result;
        }

        // Every member of a group lives in the namespace, so the namespace
        // takes whole groups with it.
        let mut first = None;
        if self.leases.is_enabled() {
            for vs in self.store.virtual_servers(&name) {
                if !vs.spec.virtual_server_address.is_empty() {
                    continue;
                }
                let (host, key) = lease_identity(&vs, &name);
                let released = self.leases.release(&vs.spec.ipam_label, &host, &key).await;
                merge_error(&mut first, released.map(|_| ()).map_err(ControllerError::from));
            }
            for ts in self.store.transport_servers(&name) {
                if !ts.spec.virtual_server_address.is_empty() {
                    continue;
                }
                let key = transport_server_key(&name, &ts.name_any());
                let released = self.leases.release(&ts.spec.ipam_label, "", &key).await;
                merge_error(&mut first, released.map(|_| ()).map_err(ControllerError::from));
            }
        }
        let before = self.resources.len();
        self.resources.retain(|_, rs| rs.meta.namespace != name);
        debug!(namespace = %name, removed = before - self.resources.len(), "Removed listeners of namespace");
        if self.namespaces.remove(&name) {
            info!(namespace = %name, "Namespace removed from scope");
        }
        into_result(first)
    }

    /// Reprocess everything cached for a namespace that just came into scope.
    /// Work items seen while it was out of scope were dropped by the worker.
    async fn replay_namespace(&mut self, namespace: &str) -> Result<(), ControllerError> {
        let mut first = None;
        for svc in self.store.services(namespace) {
            self.refresh_pool_members(&svc, false);
            if service_type(&svc) == LOAD_BALANCER {
                merge_error(&mut first, self.process_lb_service(&svc, false).await);
            }
        }
        for vs in self.store.virtual_servers(namespace) {
            merge_error(&mut first, self.process_virtual_server(&vs, false).await);
        }
        for ts in self.store.transport_servers(namespace) {
            merge_error(&mut first, self.process_transport_server(&ts, false).await);
        }
        for il in self.store.ingress_links(namespace) {
            merge_error(&mut first, self.process_ingress_link(&il, false).await);
        }
        for edns in self.store.external_dns(namespace) {
            self.process_external_dns(&edns, false);
        }
        debug!(namespace = %namespace, listeners = self.resources.len(), "Replayed namespace");
        into_result(first)
    }

    /// Kind-level scope check used by the worker before dispatch
    pub fn accepts(&self, item: &WorkItem) -> bool {
        match item.resource.kind() {
            ResourceKind::Namespace | ResourceKind::Ipam => true,
            _ => self.in_scope(&item.resource.namespace()),
        }
    }
}
