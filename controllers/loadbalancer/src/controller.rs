//! Main controller implementation.
//!
//! Wires the watchers, the reflector-backed caches, the worker and the probe
//! server together. Watchers only enqueue; the worker is the only consumer.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::KubeEventRecorder;
use crate::lease::LeaseManager;
use crate::probes::{run_probe_server, ProbeState};
use crate::publish::{AgentPublisher, ConfigPublisher, LoggingPublisher, PublishCoordinator};
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::resource::Resource;
use crate::status::KubeStatusWriter;
use crate::store::ReflectorStore;
use crate::telemetry::Telemetry;
use crate::watcher::{watch_resource, ToResource};
use crate::worker::Worker;
use crds::{ExternalDNS, IngressLink, Policy, TLSProfile, TransportServer, VirtualServer, IPAM};
use ipam_client::LeaseClient;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, ResourceExt};
use kube_runtime::reflector::{self, Store};
use kube_runtime::watcher;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

type WatchHandle = JoinHandle<Result<(), ControllerError>>;

/// Api over the watched namespace, or all namespaces
fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Start a watcher feeding a fresh cache
fn spawn_watcher<K>(
    handles: &mut Vec<WatchHandle>,
    api: Api<K>,
    config: watcher::Config,
    queue: &Arc<WorkQueue>,
    to_resource: Option<ToResource<K>>,
    resource_name: &'static str,
) -> Store<K>
where
    K: kube::Resource + Clone + Send + Sync + std::fmt::Debug + serde::de::DeserializeOwned + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone + Send + Sync,
{
    let (store, writer) = reflector::store();
    let queue = queue.clone();
    handles.push(tokio::spawn(async move {
        watch_resource(api, config, writer, queue, to_resource, resource_name).await
    }));
    store
}

async fn wait_ready<K>(store: &Store<K>, resource_name: &str) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    store
        .wait_until_ready()
        .await
        .map_err(|e| ControllerError::Watch(format!("{} cache never became ready: {}", resource_name, e)))
}

/// Main controller for load-balancer resources.
pub struct Controller {
    config: ControllerConfig,
    queue: Arc<WorkQueue>,
    watchers: Vec<WatchHandle>,
    worker: Worker,
    probe_state: Arc<ProbeState>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("partition", &self.config.partition)
            .field("watchers", &self.watchers.len())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Connect to the cluster, start every watcher and prime the caches.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing load-balancer controller");
        let client = Client::try_default().await?;
        let queue = Arc::new(WorkQueue::new());
        let telemetry = Arc::new(Telemetry::new());
        let ready = Arc::new(AtomicBool::new(false));

        // The namespace label widens the watch to all namespaces; scope is
        // then decided per item from the tracked namespace set.
        let watch_ns = if config.namespace_label.is_some() {
            None
        } else {
            config.watch_namespace.as_deref()
        };
        let all = watcher::Config::default();
        let mut watchers = Vec::new();

        let virtual_servers = spawn_watcher(
            &mut watchers,
            scoped_api::<VirtualServer>(&client, watch_ns),
            all.clone(),
            &queue,
            Some(Resource::VirtualServer as ToResource<VirtualServer>),
            "VirtualServer",
        );
        let transport_servers = spawn_watcher(
            &mut watchers,
            scoped_api::<TransportServer>(&client, watch_ns),
            all.clone(),
            &queue,
            Some(Resource::TransportServer as ToResource<TransportServer>),
            "TransportServer",
        );
        let ingress_links = spawn_watcher(
            &mut watchers,
            scoped_api::<IngressLink>(&client, watch_ns),
            all.clone(),
            &queue,
            Some(Resource::IngressLink as ToResource<IngressLink>),
            "IngressLink",
        );
        let external_dns = spawn_watcher(
            &mut watchers,
            scoped_api::<ExternalDNS>(&client, watch_ns),
            all.clone(),
            &queue,
            Some(Resource::ExternalDns as ToResource<ExternalDNS>),
            "ExternalDNS",
        );
        let policies = spawn_watcher(
            &mut watchers,
            scoped_api::<Policy>(&client, watch_ns),
            all.clone(),
            &queue,
            Some(Resource::Policy as ToResource<Policy>),
            "Policy",
        );
        let tls_profiles = spawn_watcher(
            &mut watchers,
            scoped_api::<TLSProfile>(&client, watch_ns),
            all.clone(),
            &queue,
            Some(Resource::TlsProfile as ToResource<TLSProfile>),
            "TLSProfile",
        );
        let services = spawn_watcher(
            &mut watchers,
            scoped_api::<Service>(&client, watch_ns),
            all.clone(),
            &queue,
            Some(Resource::Service as ToResource<Service>),
            "Service",
        );
        let endpoints = spawn_watcher(
            &mut watchers,
            scoped_api::<Endpoints>(&client, watch_ns),
            all.clone(),
            &queue,
            Some(Resource::Endpoints as ToResource<Endpoints>),
            "Endpoints",
        );
        let secrets = spawn_watcher(
            &mut watchers,
            scoped_api::<Secret>(&client, watch_ns),
            all.clone(),
            &queue,
            None,
            "Secret",
        );
        let nodes = spawn_watcher(
            &mut watchers,
            Api::<Node>::all(client.clone()),
            all.clone(),
            &queue,
            None,
            "Node",
        );
        let namespaces = match &config.namespace_label {
            Some(selector) => {
                let store = spawn_watcher(
                    &mut watchers,
                    Api::<Namespace>::all(client.clone()),
                    watcher::Config::default().labels(selector),
                    &queue,
                    Some(Resource::Namespace as ToResource<Namespace>),
                    "Namespace",
                );
                Some(store)
            }
            None => None,
        };
        if let Some(ipam) = &config.ipam {
            spawn_watcher(
                &mut watchers,
                Api::<IPAM>::namespaced(client.clone(), &ipam.namespace),
                watcher::Config::default().fields(&format!("metadata.name={}", ipam.name)),
                &queue,
                Some(Resource::Ipam as ToResource<IPAM>),
                "IPAM",
            );
        }

        info!("Waiting for caches to sync");
        wait_ready(&virtual_servers, "VirtualServer").await?;
        wait_ready(&transport_servers, "TransportServer").await?;
        wait_ready(&ingress_links, "IngressLink").await?;
        wait_ready(&external_dns, "ExternalDNS").await?;
        wait_ready(&policies, "Policy").await?;
        wait_ready(&tls_profiles, "TLSProfile").await?;
        wait_ready(&services, "Service").await?;
        wait_ready(&endpoints, "Endpoints").await?;
        wait_ready(&secrets, "Secret").await?;
        wait_ready(&nodes, "Node").await?;

        let initial_services = match &namespaces {
            Some(ns_store) => {
                wait_ready(ns_store, "Namespace").await?;
                let in_scope: HashSet<String> = ns_store.state().iter().map(|ns| ns.name_any()).collect();
                services
                    .state()
                    .iter()
                    .filter(|svc| svc.namespace().is_some_and(|ns| in_scope.contains(&ns)))
                    .count()
            }
            None => services.state().len(),
        };
        info!(services = initial_services, "Caches synced");

        let store = Arc::new(ReflectorStore {
            virtual_servers,
            transport_servers,
            ingress_links,
            external_dns,
            policies,
            tls_profiles,
            services,
            endpoints,
            secrets,
            nodes,
        });

        let leases = LeaseManager::new(Arc::new(LeaseClient::new(client.clone())), config.ipam.clone());
        let publisher: Arc<dyn ConfigPublisher> = match &config.agent_url {
            Some(url) => Arc::new(AgentPublisher::new(url.clone(), telemetry.clone())),
            None => Arc::new(LoggingPublisher::new(telemetry.clone())),
        };
        let reconciler = Reconciler::new(
            config.clone(),
            store.clone(),
            store,
            leases,
            Arc::new(KubeStatusWriter::new(client.clone())),
            Arc::new(KubeEventRecorder::new(client.clone())),
            telemetry.clone(),
        );
        let worker = Worker::new(
            queue.clone(),
            reconciler,
            PublishCoordinator::new(publisher, &config),
            initial_services,
            ready.clone(),
        );
        let probe_state = ProbeState::new(ready, telemetry)
            .map_err(|e| ControllerError::InvalidConfig(format!("Failed to register metrics: {}", e)))?;

        Ok(Self {
            config,
            queue,
            watchers,
            worker,
            probe_state: Arc::new(probe_state),
        })
    }

    /// Run until a shutdown signal arrives or a watcher dies, then drain
    /// the worker.
    pub async fn run(self) -> Result<(), ControllerError> {
        let Controller {
            config,
            queue,
            watchers,
            worker,
            probe_state,
        } = self;

        let probe_addr = config.probe_addr;
        let probe = tokio::spawn(async move {
            if let Err(e) = run_probe_server(probe_state, probe_addr).await {
                error!(error = %e, "Probe server failed");
            }
        });
        let worker = tokio::spawn(worker.run());
        let aborts: Vec<_> = watchers.iter().map(|h| h.abort_handle()).collect();

        info!("Load-balancer controller running");
        let result = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Shutdown signal received"),
                    Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
                }
                Ok(())
            }
            (finished, _, _) = futures::future::select_all(watchers) => {
                match finished {
                    Ok(Ok(())) => Err(ControllerError::Watch("watcher exited".to_string())),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(ControllerError::Watch(format!("watcher task failed: {}", e))),
                }
            }
        };

        queue.shut_down();
        for abort in aborts {
            abort.abort();
        }
        if let Err(e) = worker.await {
            error!(error = %e, "Worker task failed");
        }
        probe.abort();
        info!("Load-balancer controller stopped");
        result
    }
}
