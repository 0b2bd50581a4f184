//! Controller configuration.
//!
//! All settings come from environment variables and are read once at
//! startup. Invalid values fail fast with `ControllerError::InvalidConfig`.

use crate::error::ControllerError;
use std::net::SocketAddr;

/// Default device partition generated listeners are placed in
pub const DEFAULT_PARTITION: &str = "lbops";

/// Default bind address for the probe and metrics server
pub const DEFAULT_PROBE_ADDR: &str = "0.0.0.0:8080";

/// How backend pool members are addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMemberType {
    /// Members are node addresses at the service's node port
    NodePort,
    /// Members are endpoint addresses at the target port
    Cluster,
}

impl std::str::FromStr for PoolMemberType {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nodeport" => Ok(PoolMemberType::NodePort),
            "cluster" => Ok(PoolMemberType::Cluster),
            other => Err(ControllerError::InvalidConfig(format!(
                "POOL_MEMBER_TYPE must be nodeport or cluster, got {}",
                other
            ))),
        }
    }
}

/// Location of the IPAM lease object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamRef {
    pub namespace: String,
    pub name: String,
}

impl std::str::FromStr for IpamRef {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok(IpamRef {
                namespace: ns.to_string(),
                name: name.to_string(),
            }),
            _ => Err(ControllerError::InvalidConfig(format!(
                "IPAM_CR must be <namespace>/<name>, got {}",
                s
            ))),
        }
    }
}

/// Controller settings, read once at startup
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Single namespace to watch (all namespaces when unset)
    pub watch_namespace: Option<String>,
    /// Label selector choosing the namespaces in scope
    pub namespace_label: Option<String>,
    pub partition: String,
    pub pool_member_type: PoolMemberType,
    /// Lease object (address leasing disabled when unset)
    pub ipam: Option<IpamRef>,
    /// Downstream config agent endpoint
    pub agent_url: Option<String>,
    pub share_nodes: bool,
    pub default_route_domain: u32,
    pub probe_addr: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            namespace_label: None,
            partition: DEFAULT_PARTITION.to_string(),
            pool_member_type: PoolMemberType::NodePort,
            ipam: None,
            agent_url: None,
            share_nodes: false,
            default_route_domain: 0,
            probe_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let pool_member_type = match get("POOL_MEMBER_TYPE") {
            Some(v) => v.parse()?,
            None => PoolMemberType::NodePort,
        };
        let ipam = get("IPAM_CR").map(|v| v.parse()).transpose()?;
        let share_nodes = match get("SHARE_NODES") {
            Some(v) => v.parse::<bool>().map_err(|_| {
                ControllerError::InvalidConfig(format!("SHARE_NODES must be true or false, got {}", v))
            })?,
            None => false,
        };
        let default_route_domain = match get("DEFAULT_ROUTE_DOMAIN") {
            Some(v) => v.parse::<u32>().map_err(|_| {
                ControllerError::InvalidConfig(format!("DEFAULT_ROUTE_DOMAIN must be an integer, got {}", v))
            })?,
            None => 0,
        };
        let probe_addr = get("PROBE_ADDR")
            .unwrap_or_else(|| DEFAULT_PROBE_ADDR.to_string());
        let probe_addr = probe_addr.parse::<SocketAddr>().map_err(|_| {
            ControllerError::InvalidConfig(format!("PROBE_ADDR is not a socket address: {}", probe_addr))
        })?;

        Ok(Self {
            watch_namespace: get("WATCH_NAMESPACE"),
            namespace_label: get("NAMESPACE_LABEL"),
            partition: get("BIGIP_PARTITION").unwrap_or_else(|| DEFAULT_PARTITION.to_string()),
            pool_member_type,
            ipam,
            agent_url: get("AGENT_URL"),
            share_nodes,
            default_route_domain,
            probe_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.partition, "lbops");
        assert_eq!(config.pool_member_type, PoolMemberType::NodePort);
        assert!(config.ipam.is_none());
        assert_eq!(config.probe_addr.port(), 8080);
    }

    #[test]
    fn test_full_configuration() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("WATCH_NAMESPACE", "apps"),
            ("BIGIP_PARTITION", "edge"),
            ("POOL_MEMBER_TYPE", "Cluster"),
            ("IPAM_CR", "kube-system/lbops-ipam"),
            ("SHARE_NODES", "true"),
            ("DEFAULT_ROUTE_DOMAIN", "3"),
        ]))
        .unwrap();
        assert_eq!(config.watch_namespace.as_deref(), Some("apps"));
        assert_eq!(config.partition, "edge");
        assert_eq!(config.pool_member_type, PoolMemberType::Cluster);
        assert_eq!(
            config.ipam,
            Some(IpamRef { namespace: "kube-system".to_string(), name: "lbops-ipam".to_string() })
        );
        assert!(config.share_nodes);
        assert_eq!(config.default_route_domain, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ControllerConfig::from_lookup(lookup(&[("IPAM_CR", "no-slash")])).is_err());
        assert!(ControllerConfig::from_lookup(lookup(&[("POOL_MEMBER_TYPE", "hybrid")])).is_err());
        assert!(ControllerConfig::from_lookup(lookup(&[("SHARE_NODES", "yes")])).is_err());
    }
}
