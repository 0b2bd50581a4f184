//! LBops Load-Balancer Controller
//!
//! Reconciles load-balancer intent into device listener configuration:
//! - VirtualServer / TransportServer: L7 and L4 listeners, grouped by host
//! - IngressLink: listeners in front of the in-cluster ingress controller
//! - ExternalDNS: DNS wide-IPs over the generated listeners
//! - LoadBalancer Services: one listener per service port
//!
//! Addresses come either from the resources themselves or from the IPAM
//! lease object served by an external allocator.

mod association;
mod backoff;
mod builder;
mod certificate;
mod config;
mod controller;
mod error;
mod events;
mod lease;
mod pool_members;
mod probes;
mod publish;
mod queue;
mod reconciler;
mod resource;
mod resource_config;
mod status;
mod store;
mod telemetry;
#[cfg(test)]
mod test_utils;
mod watcher;
mod worker;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        return Err(ControllerError::InvalidConfig(
            "Failed to install the rustls crypto provider".to_string(),
        ));
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting LBops load-balancer controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    if let Some(label) = &config.namespace_label {
        info!("  Namespace label: {}", label);
    }
    info!("  Partition: {}", config.partition);
    info!("  Pool member type: {:?}", config.pool_member_type);
    match &config.ipam {
        Some(ipam) => info!("  IPAM object: {}/{}", ipam.namespace, ipam.name),
        None => info!("  IPAM: disabled"),
    }
    info!("  Agent: {}", config.agent_url.as_deref().unwrap_or("none (logging only)"));

    let controller = Controller::new(config).await?;
    controller.run().await
}
