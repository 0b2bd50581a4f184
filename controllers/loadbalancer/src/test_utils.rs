//! Test utilities for unit testing the reconciler
//!
//! Builders for intent objects and core kinds, an in-memory cache standing in
//! for the reflector stores, and recording doubles for the status writer, the
//! event recorder and the config publisher.

use crate::config::{ControllerConfig, IpamRef};
use crate::events::{EventRecorder, Severity};
use crate::lease::LeaseManager;
use crate::publish::{ConfigPublisher, ConfigSnapshot};
use crate::reconciler::Reconciler;
use crate::status::StatusWriter;
use crate::store::{creation_order, selector_matches, NodeAddress, NodeCache, ResourceStore};
use crate::telemetry::Telemetry;
use async_trait::async_trait;
use crds::*;
use ipam_client::MockLeaseClient;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, ObjectReference, Secret, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub const IPAM_NAMESPACE: &str = "kube-system";
pub const IPAM_NAME: &str = "lbops-ipam";

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Helper to create a test VirtualServer with one pool per `(path, service, port)`
pub fn virtual_server(
    namespace: &str,
    name: &str,
    host: &str,
    address: &str,
    pools: &[(&str, &str, i32)],
) -> VirtualServer {
    let mut vs = VirtualServer::new(
        name,
        VirtualServerSpec {
            host: host.to_string(),
            virtual_server_address: address.to_string(),
            pools: pools
                .iter()
                .map(|(path, service, port)| Pool {
                    path: path.to_string(),
                    service: service.to_string(),
                    service_port: *port,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        },
    );
    vs.metadata = meta(namespace, name);
    vs
}

/// Helper to create a test TransportServer
pub fn transport_server(
    namespace: &str,
    name: &str,
    address: &str,
    port: i32,
    service: &str,
    service_port: i32,
) -> TransportServer {
    let mut ts = TransportServer::new(
        name,
        TransportServerSpec {
            virtual_server_address: address.to_string(),
            virtual_server_port: port,
            mode: "standard".to_string(),
            pool: Pool {
                service: service.to_string(),
                service_port,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    ts.metadata = meta(namespace, name);
    ts
}

/// Helper to create a test IngressLink selecting the ingress Service by labels
pub fn ingress_link(namespace: &str, name: &str, address: &str, selector: &[(&str, &str)]) -> IngressLink {
    let mut il = IngressLink::new(
        name,
        IngressLinkSpec {
            virtual_server_address: address.to_string(),
            selector: LabelSelector {
                match_labels: selector
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            ..Default::default()
        },
    );
    il.metadata = meta(namespace, name);
    il
}

/// Helper to create a test ExternalDNS with a single pool
pub fn external_dns(
    namespace: &str,
    name: &str,
    domain: &str,
    data_server: &str,
    monitor_type: Option<&str>,
) -> ExternalDNS {
    let mut edns = ExternalDNS::new(
        name,
        ExternalDNSSpec {
            domain_name: domain.to_string(),
            pools: vec![DNSPool {
                data_server_name: data_server.to_string(),
                monitor: monitor_type.map(|t| DNSMonitor {
                    type_: t.to_string(),
                    send: "GET /".to_string(),
                    recv: String::new(),
                    interval: 10,
                    timeout: 31,
                }),
                ..Default::default()
            }],
            ..Default::default()
        },
    );
    edns.metadata = meta(namespace, name);
    edns
}

/// Helper to create a test Policy with empty rules
pub fn policy(namespace: &str, name: &str) -> Policy {
    let mut plc = Policy::new(name, PolicySpec::default());
    plc.metadata = meta(namespace, name);
    plc
}

/// Helper to create a test TLSProfile
pub fn tls_profile(
    namespace: &str,
    name: &str,
    hosts: &[&str],
    termination: &str,
    reference: &str,
    client_ssl: &str,
) -> TLSProfile {
    let mut profile = TLSProfile::new(
        name,
        TLSProfileSpec {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            tls: TLS {
                termination: termination.to_string(),
                client_ssl: client_ssl.to_string(),
                reference: reference.to_string(),
                ..Default::default()
            },
        },
    );
    profile.metadata = meta(namespace, name);
    profile
}

/// Self-signed certificate and key PEM for the given DNS names
pub fn self_signed(names: &[&str]) -> (String, String) {
    let names: Vec<String> = names.iter().map(|n| (*n).to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(names).expect("certificate generation");
    (certified.cert.pem(), certified.key_pair.serialize_pem())
}

/// Helper to create a kubernetes.io/tls Secret valid for `*.example.com`
pub fn tls_secret(namespace: &str, name: &str) -> Secret {
    let (cert, key) = self_signed(&["*.example.com"]);
    tls_secret_with(namespace, name, &cert, &key)
}

/// Helper to create a TLS Secret from PEM strings
pub fn tls_secret_with(namespace: &str, name: &str, cert: &str, key: &str) -> Secret {
    let mut data = BTreeMap::new();
    data.insert("tls.crt".to_string(), ByteString(cert.as_bytes().to_vec()));
    data.insert("tls.key".to_string(), ByteString(key.as_bytes().to_vec()));
    Secret {
        metadata: meta(namespace, name),
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Helper to create a Service; a node port of 0 leaves it unset
pub fn service(namespace: &str, name: &str, type_: &str, ports: &[(i32, i32, i32)]) -> Service {
    Service {
        metadata: meta(namespace, name),
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port, target, node_port)| ServicePort {
                        name: Some(format!("port-{}", port)),
                        port: *port,
                        protocol: Some("TCP".to_string()),
                        target_port: Some(IntOrString::Int(*target)),
                        node_port: (*node_port > 0).then_some(*node_port),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

/// Helper to create Endpoints with one `http` port and `(ip, node)` addresses
pub fn endpoints(namespace: &str, name: &str, addresses: &[(&str, &str)], port: i32) -> Endpoints {
    Endpoints {
        metadata: meta(namespace, name),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                addresses
                    .iter()
                    .map(|(ip, node)| EndpointAddress {
                        ip: ip.to_string(),
                        node_name: Some(node.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                name: Some("http".to_string()),
                port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

#[derive(Debug, Clone)]
struct TestNode {
    name: String,
    address: String,
    labels: BTreeMap<String, String>,
}

fn upsert<K: kube::Resource>(list: &Mutex<Vec<Arc<K>>>, obj: K) {
    let mut list = list.lock().unwrap();
    let (namespace, name) = (obj.meta().namespace.clone(), obj.meta().name.clone());
    list.retain(|o| !(o.meta().namespace == namespace && o.meta().name == name));
    list.push(Arc::new(obj));
}

fn remove<K: kube::Resource>(list: &Mutex<Vec<Arc<K>>>, namespace: &str, name: &str) {
    list.lock()
        .unwrap()
        .retain(|o| !(o.meta().namespace.as_deref() == Some(namespace) && o.meta().name.as_deref() == Some(name)));
}

fn list_in<K: kube::Resource>(list: &Mutex<Vec<Arc<K>>>, namespace: &str) -> Vec<Arc<K>> {
    let mut items: Vec<Arc<K>> = list
        .lock()
        .unwrap()
        .iter()
        .filter(|o| namespace.is_empty() || o.meta().namespace.as_deref() == Some(namespace))
        .cloned()
        .collect();
    items.sort_by(|a, b| creation_order(a.meta(), b.meta()));
    items
}

fn find<K: kube::Resource>(list: &Mutex<Vec<Arc<K>>>, namespace: &str, name: &str) -> Option<Arc<K>> {
    list.lock()
        .unwrap()
        .iter()
        .find(|o| o.meta().namespace.as_deref() == Some(namespace) && o.meta().name.as_deref() == Some(name))
        .cloned()
}

/// In-memory cache implementing both store traits
#[derive(Debug, Default)]
pub struct MemoryStore {
    virtual_servers: Mutex<Vec<Arc<VirtualServer>>>,
    transport_servers: Mutex<Vec<Arc<TransportServer>>>,
    ingress_links: Mutex<Vec<Arc<IngressLink>>>,
    external_dns: Mutex<Vec<Arc<ExternalDNS>>>,
    policies: Mutex<Vec<Arc<Policy>>>,
    tls_profiles: Mutex<Vec<Arc<TLSProfile>>>,
    services: Mutex<Vec<Arc<Service>>>,
    endpoints: Mutex<Vec<Arc<Endpoints>>>,
    secrets: Mutex<Vec<Arc<Secret>>>,
    nodes: Mutex<Vec<TestNode>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_virtual_server(&self, vs: VirtualServer) {
        upsert(&self.virtual_servers, vs);
    }

    pub fn remove_virtual_server(&self, namespace: &str, name: &str) {
        remove(&self.virtual_servers, namespace, name);
    }

    pub fn add_transport_server(&self, ts: TransportServer) {
        upsert(&self.transport_servers, ts);
    }

    pub fn remove_transport_server(&self, namespace: &str, name: &str) {
        remove(&self.transport_servers, namespace, name);
    }

    pub fn add_ingress_link(&self, il: IngressLink) {
        upsert(&self.ingress_links, il);
    }

    pub fn add_external_dns(&self, edns: ExternalDNS) {
        upsert(&self.external_dns, edns);
    }

    pub fn add_policy(&self, plc: Policy) {
        upsert(&self.policies, plc);
    }

    pub fn add_tls_profile(&self, profile: TLSProfile) {
        upsert(&self.tls_profiles, profile);
    }

    pub fn add_secret(&self, secret: Secret) {
        upsert(&self.secrets, secret);
    }

    pub fn add_service(&self, svc: Service) {
        upsert(&self.services, svc);
    }

    pub fn remove_service(&self, namespace: &str, name: &str) {
        remove(&self.services, namespace, name);
    }

    pub fn add_endpoints(&self, eps: Endpoints) {
        upsert(&self.endpoints, eps);
    }

    pub fn add_node(&self, name: &str, address: &str, labels: &[(&str, &str)]) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.retain(|n| n.name != name);
        nodes.push(TestNode {
            name: name.to_string(),
            address: address.to_string(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        });
    }
}

impl ResourceStore for MemoryStore {
    fn virtual_servers(&self, namespace: &str) -> Vec<Arc<VirtualServer>> {
        list_in(&self.virtual_servers, namespace)
    }

    fn transport_servers(&self, namespace: &str) -> Vec<Arc<TransportServer>> {
        list_in(&self.transport_servers, namespace)
    }

    fn ingress_links(&self, namespace: &str) -> Vec<Arc<IngressLink>> {
        list_in(&self.ingress_links, namespace)
    }

    fn external_dns(&self, namespace: &str) -> Vec<Arc<ExternalDNS>> {
        list_in(&self.external_dns, namespace)
    }

    fn services(&self, namespace: &str) -> Vec<Arc<Service>> {
        list_in(&self.services, namespace)
    }

    fn policy(&self, namespace: &str, name: &str) -> Option<Arc<Policy>> {
        find(&self.policies, namespace, name)
    }

    fn tls_profile(&self, namespace: &str, name: &str) -> Option<Arc<TLSProfile>> {
        find(&self.tls_profiles, namespace, name)
    }

    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        find(&self.services, namespace, name)
    }

    fn endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>> {
        find(&self.endpoints, namespace, name)
    }

    fn secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        find(&self.secrets, namespace, name)
    }
}

impl NodeCache for MemoryStore {
    fn list_nodes(&self, label_selector: Option<&str>) -> Vec<NodeAddress> {
        let mut nodes: Vec<NodeAddress> = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| label_selector.is_none_or(|sel| selector_matches(sel, &n.labels)))
            .map(|n| NodeAddress {
                name: n.name.clone(),
                address: n.address.clone(),
            })
            .collect();
        nodes.sort();
        nodes
    }
}

/// Captures every published snapshot
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    snapshots: Mutex<Vec<ConfigSnapshot>>,
}

impl RecordingPublisher {
    pub fn snapshots(&self) -> Vec<ConfigSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }
}

impl ConfigPublisher for RecordingPublisher {
    fn post_config(&self, snapshot: ConfigSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot);
    }
}

/// One status write, keyed by `<namespace>/<name>`
#[derive(Debug, Clone, PartialEq)]
pub enum StatusWrite {
    VirtualServer(String, String),
    TransportServer(String, String),
    IngressLink(String, String),
    ServiceIngress(String, Vec<String>),
}

fn object_key<K: kube::Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Records status writes instead of patching the API server
#[derive(Debug, Default)]
pub struct RecordingStatusWriter {
    writes: Mutex<Vec<StatusWrite>>,
}

impl RecordingStatusWriter {
    pub fn writes(&self) -> Vec<StatusWrite> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusWriter for RecordingStatusWriter {
    async fn virtual_server_status(&self, vs: &VirtualServer, status: &VirtualServerStatus) -> Result<(), kube::Error> {
        self.writes
            .lock()
            .unwrap()
            .push(StatusWrite::VirtualServer(object_key(vs), status.vs_address.clone()));
        Ok(())
    }

    async fn transport_server_status(&self, ts: &TransportServer, status: &TransportServerStatus) -> Result<(), kube::Error> {
        self.writes
            .lock()
            .unwrap()
            .push(StatusWrite::TransportServer(object_key(ts), status.vs_address.clone()));
        Ok(())
    }

    async fn ingress_link_status(&self, il: &IngressLink, status: &IngressLinkStatus) -> Result<(), kube::Error> {
        self.writes
            .lock()
            .unwrap()
            .push(StatusWrite::IngressLink(object_key(il), status.vs_address.clone()));
        Ok(())
    }

    async fn service_ingress(&self, svc: &Service, ips: &[String]) -> Result<(), kube::Error> {
        self.writes
            .lock()
            .unwrap()
            .push(StatusWrite::ServiceIngress(object_key(svc), ips.to_vec()));
        Ok(())
    }
}

/// One recorded Event
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub object: String,
    pub severity: Severity,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn record(&self, object: &ObjectReference, severity: Severity, reason: &str, message: &str) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: format!(
                "{}/{}",
                object.namespace.clone().unwrap_or_default(),
                object.name.clone().unwrap_or_default()
            ),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Config with leasing against the mock lease object
pub fn ipam_config() -> ControllerConfig {
    ControllerConfig {
        ipam: Some(IpamRef {
            namespace: IPAM_NAMESPACE.to_string(),
            name: IPAM_NAME.to_string(),
        }),
        ..Default::default()
    }
}

/// Reconciler wired to in-memory doubles; every handle shares state with it
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub leases: MockLeaseClient,
    pub status: Arc<RecordingStatusWriter>,
    pub events: Arc<RecordingEvents>,
    pub telemetry: Arc<Telemetry>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new(config: ControllerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let leases = MockLeaseClient::with_object(IPAM_NAMESPACE, IPAM_NAME);
        let status = Arc::new(RecordingStatusWriter::default());
        let events = Arc::new(RecordingEvents::default());
        let telemetry = Arc::new(Telemetry::new());
        let manager = LeaseManager::new(Arc::new(leases.clone()), config.ipam.clone());
        let reconciler = Reconciler::new(
            config,
            store.clone(),
            store.clone(),
            manager,
            status.clone(),
            events.clone(),
            telemetry.clone(),
        );
        Self {
            store,
            leases,
            status,
            events,
            telemetry,
            reconciler,
        }
    }

    /// Listener names currently generated, sorted
    pub fn listener_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.reconciler.resources().keys().cloned().collect();
        names.sort();
        names
    }

    /// Play the allocator for a host-keyed request
    pub fn allocate_host(&self, host: &str, label: &str, ip: &str) {
        self.leases.allocate(IPAM_NAMESPACE, IPAM_NAME, host, "", label, ip);
    }

    /// Play the allocator for a key-keyed request
    pub fn allocate_key(&self, key: &str, label: &str, ip: &str) {
        self.leases.allocate(IPAM_NAMESPACE, IPAM_NAME, "", key, label, ip);
    }

    /// The lease object as the reconciler would receive it from its watcher
    pub fn ipam_object(&self) -> IPAM {
        self.leases.object(IPAM_NAMESPACE, IPAM_NAME).unwrap()
    }
}
