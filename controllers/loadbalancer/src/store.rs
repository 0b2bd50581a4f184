//! Read access to the watch caches.
//!
//! The reconcile core only reads cluster state through [`ResourceStore`] and
//! [`NodeCache`]. In production both are backed by kube-runtime reflector
//! stores; tests use an in-memory store. Lists are returned in creation
//! order so association results are deterministic.

use crds::{ExternalDNS, IngressLink, Policy, TLSProfile, TransportServer, VirtualServer};
use k8s_openapi::api::core::v1::{Endpoints, Node, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::{ObjectRef, Store};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Arc;

/// Cached intent and core resources. An empty namespace lists all namespaces.
pub trait ResourceStore: Send + Sync {
    fn virtual_servers(&self, namespace: &str) -> Vec<Arc<VirtualServer>>;
    fn transport_servers(&self, namespace: &str) -> Vec<Arc<TransportServer>>;
    fn ingress_links(&self, namespace: &str) -> Vec<Arc<IngressLink>>;
    fn external_dns(&self, namespace: &str) -> Vec<Arc<ExternalDNS>>;
    fn services(&self, namespace: &str) -> Vec<Arc<Service>>;
    fn policy(&self, namespace: &str, name: &str) -> Option<Arc<Policy>>;
    fn tls_profile(&self, namespace: &str, name: &str) -> Option<Arc<TLSProfile>>;
    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>>;
    fn endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>>;
    fn secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>>;
}

/// A schedulable node and the address pool members use
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeAddress {
    pub name: String,
    pub address: String,
}

/// Cached cluster nodes
pub trait NodeCache: Send + Sync {
    /// Nodes, optionally restricted by a label selector such as `pool=edge`
    fn list_nodes(&self, label_selector: Option<&str>) -> Vec<NodeAddress>;
}

/// Creation timestamp, then namespace, then name
pub fn creation_order(a: &ObjectMeta, b: &ObjectMeta) -> Ordering {
    a.creation_timestamp
        .cmp(&b.creation_timestamp)
        .then_with(|| a.namespace.cmp(&b.namespace))
        .then_with(|| a.name.cmp(&b.name))
}

/// Matches a comma separated selector (`k=v`, `k==v`, `k!=v`, `k`, `!k`)
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).is_none_or(|lv| lv != v.trim())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                labels.get(k.trim()).is_some_and(|lv| lv == v.trim())
            } else if let Some(k) = term.strip_prefix('!') {
                !labels.contains_key(k.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

/// Internal address of a schedulable node
pub fn node_address(node: &Node) -> Option<NodeAddress> {
    if node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false) {
        return None;
    }
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    let address = addresses.iter().find(|a| a.type_ == "InternalIP")?;
    Some(NodeAddress {
        name: node.metadata.name.clone().unwrap_or_default(),
        address: address.address.clone(),
    })
}

/// Reflector-backed caches, one store per watched kind
#[derive(Clone)]
pub struct ReflectorStore {
    pub virtual_servers: Store<VirtualServer>,
    pub transport_servers: Store<TransportServer>,
    pub ingress_links: Store<IngressLink>,
    pub external_dns: Store<ExternalDNS>,
    pub policies: Store<Policy>,
    pub tls_profiles: Store<TLSProfile>,
    pub services: Store<Service>,
    pub endpoints: Store<Endpoints>,
    pub secrets: Store<Secret>,
    pub nodes: Store<Node>,
}

impl std::fmt::Debug for ReflectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectorStore").finish_non_exhaustive()
    }
}

fn list_sorted<K>(store: &Store<K>, namespace: &str) -> Vec<Arc<K>>
where
    K: kube::Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    let mut items: Vec<Arc<K>> = store
        .state()
        .into_iter()
        .filter(|o| namespace.is_empty() || o.meta().namespace.as_deref() == Some(namespace))
        .collect();
    items.sort_by(|a, b| creation_order(a.meta(), b.meta()));
    items
}

fn get_by_key<K>(store: &Store<K>, namespace: &str, name: &str) -> Option<Arc<K>>
where
    K: kube::Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    store.get(&ObjectRef::new(name).within(namespace))
}

impl ResourceStore for ReflectorStore {
    fn virtual_servers(&self, namespace: &str) -> Vec<Arc<VirtualServer>> {
        list_sorted(&self.virtual_servers, namespace)
    }

    fn transport_servers(&self, namespace: &str) -> Vec<Arc<TransportServer>> {
        list_sorted(&self.transport_servers, namespace)
    }

    fn ingress_links(&self, namespace: &str) -> Vec<Arc<IngressLink>> {
        list_sorted(&self.ingress_links, namespace)
    }

    fn external_dns(&self, namespace: &str) -> Vec<Arc<ExternalDNS>> {
        list_sorted(&self.external_dns, namespace)
    }

    fn services(&self, namespace: &str) -> Vec<Arc<Service>> {
        list_sorted(&self.services, namespace)
    }

    fn policy(&self, namespace: &str, name: &str) -> Option<Arc<Policy>> {
        get_by_key(&self.policies, namespace, name)
    }

    fn tls_profile(&self, namespace: &str, name: &str) -> Option<Arc<TLSProfile>> {
        get_by_key(&self.tls_profiles, namespace, name)
    }

    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        get_by_key(&self.services, namespace, name)
    }

    fn endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>> {
        get_by_key(&self.endpoints, namespace, name)
    }

    fn secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        get_by_key(&self.secrets, namespace, name)
    }
}

impl NodeCache for ReflectorStore {
    fn list_nodes(&self, label_selector: Option<&str>) -> Vec<NodeAddress> {
        let mut nodes: Vec<NodeAddress> = self
            .nodes
            .state()
            .iter()
            .filter(|n| match label_selector {
                Some(sel) => selector_matches(sel, n.metadata.labels.as_ref().unwrap_or(&BTreeMap::new())),
                None => true,
            })
            .filter_map(|n| node_address(n))
            .collect();
        nodes.sort();
        nodes
    }
}
