//! Pool member resolution.
//!
//! A per-service cache is refreshed whenever a Service or its Endpoints
//! change; listener pools are then filled from it either with node
//! addresses at the service's node port, or with the endpoint addresses
//! themselves.

use crate::config::PoolMemberType;
use crate::resource_config::{PoolMember, ResourceConfig};
use crate::store::{NodeAddress, NodeCache};
use k8s_openapi::api::core::v1::{Endpoints, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Endpoint port a member list was collected for
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRef {
    pub name: String,
    pub port: i32,
}

/// Cached membership of one Service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolMembersInfo {
    pub service_type: String,
    pub port_specs: Vec<ServicePort>,
    pub member_map: BTreeMap<PortRef, Vec<PoolMember>>,
}

/// Cache keyed by `<namespace>/<service>`
pub type PoolMembersCache = HashMap<String, PoolMembersInfo>;

/// Membership cache key of a Service
pub fn service_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Build the cache entry for `service` from its Endpoints.
///
/// Only addresses on known nodes are admitted, except for headless
/// services which admit every address.
pub fn build_pool_members_info(service: &Service, endpoints: Option<&Endpoints>, nodes: &[NodeAddress]) -> PoolMembersInfo {
    let spec = service.spec.clone().unwrap_or_default();
    let headless = spec.cluster_ip.as_deref() == Some("None");
    let known: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();

    let mut info = PoolMembersInfo {
        service_type: spec.type_.clone().unwrap_or_else(|| "ClusterIP".to_string()),
        port_specs: spec.ports.clone().unwrap_or_default(),
        member_map: BTreeMap::new(),
    };

    let subsets = endpoints.and_then(|e| e.subsets.as_ref());
    for subset in subsets.into_iter().flatten() {
        for port in subset.ports.iter().flatten() {
            let mut members: Vec<PoolMember> = subset
                .addresses
                .iter()
                .flatten()
                .filter(|addr| {
                    headless
                        || addr
                            .node_name
                            .as_deref()
                            .is_some_and(|n| known.contains(n))
                })
                .map(|addr| PoolMember::new(addr.ip.clone(), port.port))
                .collect();
            members.sort();
            let key = PortRef {
                name: port.name.clone().unwrap_or_default(),
                port: port.port,
            };
            info.member_map.entry(key).or_default().extend(members);
        }
    }
    info
}

/// Node port of the service port matching `service_port`
pub fn node_port(port_specs: &[ServicePort], service_port: i32) -> Option<i32> {
    port_specs
        .iter()
        .find(|p| p.port == service_port || target_port_int(p) == Some(service_port))
        .and_then(|p| p.node_port)
}

fn target_port_int(port: &ServicePort) -> Option<i32> {
    match &port.target_port {
        Some(IntOrString::Int(i)) => Some(*i),
        _ => None,
    }
}

/// Members for node-port mode: every eligible node at `port`
pub fn node_port_members(nodes: &dyn NodeCache, port: i32, node_member_label: &str) -> Vec<PoolMember> {
    let selector = (!node_member_label.is_empty()).then_some(node_member_label);
    let mut members: Vec<PoolMember> = nodes
        .list_nodes(selector)
        .into_iter()
        .map(|n| PoolMember::new(n.address, port))
        .collect();
    members.sort();
    members.dedup();
    members
}

/// Cluster-mode lookup: the endpoint list behind `service_port`
fn cluster_members(info: &PoolMembersInfo, service_port: i32) -> Vec<PoolMember> {
    let target = info
        .port_specs
        .iter()
        .find(|p| p.port == service_port)
        .and_then(|p| p.target_port.clone());
    for (port_ref, members) in &info.member_map {
        if members.is_empty() {
            continue;
        }
        let matched = match &target {
            Some(IntOrString::Int(port)) => port_ref.port == *port,
            Some(IntOrString::String(name)) => port_ref.name == *name,
            None => port_ref.port == service_port,
        };
        if matched {
            return members.clone();
        }
    }
    Vec::new()
}

/// Fill every pool of `rs` from the cache and mark it active when any pool
/// has members. An inactive listener is published disabled. Missing cache
/// entries leave the pool empty.
pub fn update_pool_members(
    rs: &mut ResourceConfig,
    namespace: &str,
    cache: &PoolMembersCache,
    mode: PoolMemberType,
    nodes: &dyn NodeCache,
) {
    for pool in rs.pools.iter_mut() {
        let Some(info) = cache.get(&service_key(namespace, &pool.service_name)) else {
            debug!(pool = %pool.name, "No cached membership for service {}", pool.service_name);
            pool.members.clear();
            continue;
        };
        pool.members = match mode {
            PoolMemberType::NodePort => {
                if info.service_type != "NodePort" && info.service_type != "LoadBalancer" {
                    debug!(pool = %pool.name, "Service {} is {}, not NodePort or LoadBalancer", pool.service_name, info.service_type);
                }
                match node_port(&info.port_specs, pool.service_port) {
                    Some(port) => node_port_members(nodes, port, &pool.node_member_label),
                    None => Vec::new(),
                }
            }
            PoolMemberType::Cluster => cluster_members(info, pool.service_port),
        };
    }
    rs.meta.active = rs.pools.iter().any(|p| !p.members.is_empty());
    rs.virtual_server.enabled = rs.meta.active;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_config::{Pool, ResourceType};
    use crate::test_utils::*;

    fn rs_with_pool(service: &str, port: i32, label: &str) -> ResourceConfig {
        let mut rs = ResourceConfig::new("crd_1_1_1_1_80", "lbops", "1.1.1.1", 80, ResourceType::VirtualServer);
        rs.pools.push(Pool {
            name: format!("{}_{}_apps", service, port),
            service_name: service.to_string(),
            service_port: port,
            node_member_label: label.to_string(),
            ..Default::default()
        });
        rs
    }

    #[test]
    fn test_members_restricted_to_known_nodes() {
        let svc = service("apps", "web", "NodePort", &[(80, 8080, 30080)]);
        let eps = endpoints("apps", "web", &[("10.244.0.5", "node-a"), ("10.244.9.9", "gone")], 8080);
        let nodes = vec![NodeAddress {
            name: "node-a".to_string(),
            address: "192.168.0.10".to_string(),
        }];
        let info = build_pool_members_info(&svc, Some(&eps), &nodes);
        let members = &info.member_map[&PortRef { name: "http".to_string(), port: 8080 }];
        assert_eq!(members, &vec![PoolMember::new("10.244.0.5", 8080)]);
    }

    #[test]
    fn test_headless_service_admits_all_addresses() {
        let mut svc = service("apps", "web", "ClusterIP", &[(80, 8080, 0)]);
        svc.spec.as_mut().unwrap().cluster_ip = Some("None".to_string());
        let eps = endpoints("apps", "web", &[("10.244.0.5", "node-a"), ("10.244.9.9", "gone")], 8080);
        let info = build_pool_members_info(&svc, Some(&eps), &[]);
        assert_eq!(info.member_map.values().next().unwrap().len(), 2);
    }

    #[test]
    fn test_node_port_mode_uses_node_addresses() {
        let store = MemoryStore::new();
        store.add_node("node-a", "192.168.0.10", &[("pool", "edge")]);
        store.add_node("node-b", "192.168.0.11", &[]);
        let svc = service("apps", "web", "NodePort", &[(80, 8080, 30080)]);
        let mut cache = PoolMembersCache::new();
        cache.insert(service_key("apps", "web"), build_pool_members_info(&svc, None, &[]));

        let mut rs = rs_with_pool("web", 80, "");
        update_pool_members(&mut rs, "apps", &cache, PoolMemberType::NodePort, &store);
        assert!(rs.meta.active);
        assert_eq!(
            rs.pools[0].members,
            vec![PoolMember::new("192.168.0.10", 30080), PoolMember::new("192.168.0.11", 30080)]
        );

        let mut rs = rs_with_pool("web", 80, "pool=edge");
        update_pool_members(&mut rs, "apps", &cache, PoolMemberType::NodePort, &store);
        assert_eq!(rs.pools[0].members, vec![PoolMember::new("192.168.0.10", 30080)]);
    }

    #[test]
    fn test_cluster_mode_maps_service_port_to_endpoints() {
        let store = MemoryStore::new();
        store.add_node("node-a", "192.168.0.10", &[]);
        let svc = service("apps", "web", "ClusterIP", &[(80, 8080, 0)]);
        let eps = endpoints("apps", "web", &[("10.244.0.5", "node-a")], 8080);
        let mut cache = PoolMembersCache::new();
        cache.insert(
            service_key("apps", "web"),
            build_pool_members_info(&svc, Some(&eps), &store.list_nodes(None)),
        );

        let mut rs = rs_with_pool("web", 80, "");
        update_pool_members(&mut rs, "apps", &cache, PoolMemberType::Cluster, &store);
        assert!(rs.meta.active);
        assert_eq!(rs.pools[0].members, vec![PoolMember::new("10.244.0.5", 8080)]);
    }

    #[test]
    fn test_missing_service_leaves_listener_inactive() {
        let store = MemoryStore::new();
        let mut rs = rs_with_pool("web", 80, "");
        update_pool_members(&mut rs, "apps", &PoolMembersCache::new(), PoolMemberType::Cluster, &store);
        assert!(!rs.meta.active);
        assert!(!rs.virtual_server.enabled);
        assert!(rs.pools[0].members.is_empty());
    }
}
