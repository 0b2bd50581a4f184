//! Publish coordinator.
//!
//! Keeps the last published generation and hands a new snapshot to the
//! downstream publisher only when the listener map or the wide-IP map
//! changed. The worker calls it once the queue has drained, so a burst of
//! events becomes one device update.

use crate::config::ControllerConfig;
use crate::resource_config::{CustomProfile, DnsConfig, ResourceMap};
use crate::telemetry::Telemetry;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Everything handed downstream in one publish
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub partition: String,
    pub share_nodes: bool,
    pub default_route_domain: u32,
    pub resources: ResourceMap,
    pub dns: DnsConfig,
    /// TLS profiles built from Secrets, across all listeners
    pub custom_profiles: Vec<CustomProfile>,
}

/// Downstream consumer of snapshots; no acknowledgement is expected
pub trait ConfigPublisher: Send + Sync {
    fn post_config(&self, snapshot: ConfigSnapshot);
}

/// Posts snapshots as JSON to the config agent
pub struct AgentPublisher {
    client: reqwest::Client,
    url: String,
    telemetry: Arc<Telemetry>,
}

impl std::fmt::Debug for AgentPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPublisher").field("url", &self.url).finish_non_exhaustive()
    }
}

impl AgentPublisher {
    /// Publisher posting to `url`
    pub fn new(url: String, telemetry: Arc<Telemetry>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            telemetry,
        }
    }
}

impl ConfigPublisher for AgentPublisher {
    fn post_config(&self, snapshot: ConfigSnapshot) {
        let client = self.client.clone();
        let url = self.url.clone();
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            let listeners = snapshot.resources.len();
            let result = client
                .post(&url)
                .json(&snapshot)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match result {
                Ok(_) => {
                    info!(listeners, "Published configuration to {}", url);
                    telemetry.record_publish(true);
                }
                Err(e) => {
                    error!(error = %e, "Failed to publish configuration to {}", url);
                    telemetry.record_publish(false);
                }
            }
        });
    }
}

/// Logs snapshots instead of sending them anywhere
#[derive(Debug)]
pub struct LoggingPublisher {
    telemetry: Arc<Telemetry>,
}

impl LoggingPublisher {
    /// Publisher that only logs what it would send
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        Self { telemetry }
    }
}

impl ConfigPublisher for LoggingPublisher {
    fn post_config(&self, snapshot: ConfigSnapshot) {
        info!(
            listeners = snapshot.resources.len(),
            wide_ips = snapshot.dns.len(),
            custom_profiles = snapshot.custom_profiles.len(),
            "Configuration ready (no agent configured)"
        );
        match serde_json::to_string(&snapshot) {
            Ok(body) => debug!(%body, "Configuration snapshot"),
            Err(e) => debug!(error = %e, "Configuration snapshot is not serializable"),
        }
        self.telemetry.record_publish(true);
    }
}

/// Tracks the last published generation
pub struct PublishCoordinator {
    publisher: Arc<dyn ConfigPublisher>,
    partition: String,
    share_nodes: bool,
    default_route_domain: u32,
    previous_resources: ResourceMap,
    previous_dns: DnsConfig,
}

impl std::fmt::Debug for PublishCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishCoordinator")
            .field("partition", &self.partition)
            .field("published_listeners", &self.previous_resources.len())
            .finish_non_exhaustive()
    }
}

impl PublishCoordinator {
    /// Coordinator with nothing published yet
    pub fn new(publisher: Arc<dyn ConfigPublisher>, config: &ControllerConfig) -> Self {
        Self {
            publisher,
            partition: config.partition.clone(),
            share_nodes: config.share_nodes,
            default_route_domain: config.default_route_domain,
            previous_resources: ResourceMap::new(),
            previous_dns: DnsConfig::new(),
        }
    }

    /// Publish when either map differs from the last published generation.
    /// Returns true when a snapshot was handed downstream.
    pub fn publish_if_changed(&mut self, resources: &ResourceMap, dns: &DnsConfig) -> bool {
        if *resources == self.previous_resources && *dns == self.previous_dns {
            debug!("Generated configuration unchanged, nothing to publish");
            return false;
        }

        let custom_profiles: Vec<CustomProfile> = resources
            .values()
            .flat_map(|rs| rs.custom_profiles.values().cloned())
            .collect();
        let snapshot = ConfigSnapshot {
            partition: self.partition.clone(),
            share_nodes: self.share_nodes,
            default_route_domain: self.default_route_domain,
            resources: resources.clone(),
            dns: dns.clone(),
            custom_profiles,
        };
        info!(
            listeners = resources.len(),
            wide_ips = dns.len(),
            "Publishing configuration"
        );
        self.publisher.post_config(snapshot);
        self.previous_resources = resources.clone();
        self.previous_dns = dns.clone();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolMemberType;
    use crate::pool_members::{update_pool_members, PoolMembersCache};
    use crate::resource_config::{Pool, ResourceConfig, ResourceType, SecretKey, WideIP};
    use crate::test_utils::{MemoryStore, RecordingPublisher};

    fn listener(name: &str) -> ResourceConfig {
        ResourceConfig::new(name, "lbops", "1.1.1.1", 80, ResourceType::VirtualServer)
    }

    #[test]
    fn test_publishes_only_on_change() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut coordinator = PublishCoordinator::new(publisher.clone(), &ControllerConfig::default());
        let mut resources = ResourceMap::new();
        resources.insert("crd_1_1_1_1_80".to_string(), listener("crd_1_1_1_1_80"));
        let dns = DnsConfig::new();

        assert!(coordinator.publish_if_changed(&resources, &dns));
        assert!(!coordinator.publish_if_changed(&resources, &dns));
        assert_eq!(publisher.snapshots().len(), 1);

        let mut dns = DnsConfig::new();
        dns.insert("foo.com".to_string(), WideIP::default());
        assert!(coordinator.publish_if_changed(&resources, &dns));
        assert_eq!(publisher.snapshots().len(), 2);
    }

    #[test]
    fn test_custom_profiles_are_aggregated() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut coordinator = PublishCoordinator::new(publisher.clone(), &ControllerConfig::default());
        let mut resources = ResourceMap::new();
        for (name, secret) in [("crd_1_1_1_1_443", "a"), ("crd_2_2_2_2_443", "b")] {
            let mut rs = listener(name);
            rs.custom_profiles.insert(
                SecretKey {
                    name: secret.to_string(),
                    resource_name: name.to_string(),
                },
                CustomProfile {
                    name: secret.to_string(),
                    partition: "lbops".to_string(),
                    context: "clientside".to_string(),
                    cert: "cert".to_string(),
                    key: "key".to_string(),
                    server_name: String::new(),
                    sni_default: false,
                },
            );
            resources.insert(name.to_string(), rs);
        }

        coordinator.publish_if_changed(&resources, &DnsConfig::new());
        let snapshot = publisher.snapshots().pop().unwrap();
        assert_eq!(snapshot.partition, "lbops");
        assert_eq!(snapshot.custom_profiles.len(), 2);
        assert!(serde_json::to_string(&snapshot).is_ok());
    }

    #[test]
    fn test_listener_without_members_is_published_disabled() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut coordinator = PublishCoordinator::new(publisher.clone(), &ControllerConfig::default());
        let mut rs = listener("crd_1_1_1_1_80");
        rs.pools.push(Pool {
            name: "web_80_apps".to_string(),
            service_name: "web".to_string(),
            service_port: 80,
            ..Default::default()
        });
        update_pool_members(
            &mut rs,
            "apps",
            &PoolMembersCache::new(),
            PoolMemberType::NodePort,
            &MemoryStore::new(),
        );
        let mut resources = ResourceMap::new();
        resources.insert("crd_1_1_1_1_80".to_string(), rs);

        coordinator.publish_if_changed(&resources, &DnsConfig::new());
        let snapshot = publisher.snapshots().pop().unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["resources"]["crd_1_1_1_1_80"]["virtual"]["enabled"], false);
    }
}
