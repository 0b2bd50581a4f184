//! Resource config builder.
//!
//! Turns an association group (or a single IngressLink, TransportServer or
//! LoadBalancer Service) into listener artifacts. Policy and TLS problems
//! surface as [`ControllerError::Logic`] for the port being built.

use crate::certificate::check_certificate;
use crate::error::ControllerError;
use crate::resource_config::{
    custom_virtual_server_name, format_name, ingress_link_name, lb_service_name, monitor_name, pool_name,
    virtual_server_name, CustomProfile, DataGroup, ForwardingRule, GslbPool, IRule, Monitor, Pool,
    PolicyFragment, ProfileRef, ResourceConfig, ResourceMap, ResourceType, SecretKey, WideIP,
};
use crate::store::ResourceStore;
use crds::{
    ExternalDNS, IngressLink, Policy, TLSProfile, TransportServer, VirtualServer, HTTP_TRAFFIC_REDIRECT,
    TLS_PASSTHROUGH, TLS_REENCRYPT, TLS_REFERENCE_BIGIP, TLS_REFERENCE_SECRET,
};
use k8s_openapi::api::core::v1::{Service, ServicePort};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::debug;

/// Readiness port of the ingress controller; never exposed as a listener
pub const NGINX_MONITOR_PORT: i32 = 8081;
/// Partition holding shared device objects such as GSLB monitors
pub const COMMON_PARTITION: &str = "Common";
/// Source address translation when the intent sets none
pub const DEFAULT_SNAT: &str = "auto";
/// Wide-IP record type when the ExternalDNS sets none
pub const DEFAULT_RECORD_TYPE: &str = "A";
/// Wide-IP load-balancing method when the ExternalDNS sets none
pub const DEFAULT_LB_METHOD: &str = "round-robin";

const CLIENT_SIDE: &str = "clientside";
const SERVER_SIDE: &str = "serverside";
const ALL_CONTEXTS: &str = "all";

/// A listener port of a VirtualServer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualPort {
    pub port: i32,
    pub protocol: &'static str,
}

/// HTTP listener always; HTTPS as well when a TLSProfile is referenced
pub fn virtual_ports(vs: &VirtualServer) -> Vec<VirtualPort> {
    let mut ports = vec![VirtualPort {
        port: vs.http_port(),
        protocol: "http",
    }];
    if vs.is_tls() {
        ports.push(VirtualPort {
            port: vs.https_port(),
            protocol: "https",
        });
    }
    ports
}

/// Listener name for a VirtualServer or TransportServer port
pub fn listener_name(custom_name: &str, address: &str, port: i32) -> String {
    if custom_name.is_empty() {
        virtual_server_name(address, port)
    } else {
        custom_virtual_server_name(custom_name, port)
    }
}

/// Builds listener artifacts from intent, reading referenced objects from the store
pub struct ConfigBuilder<'a> {
    store: &'a dyn ResourceStore,
    partition: &'a str,
}

impl std::fmt::Debug for ConfigBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigBuilder").field("partition", &self.partition).finish()
    }
}

impl<'a> ConfigBuilder<'a> {
    /// Builder for listeners in `partition`
    pub fn new(store: &'a dyn ResourceStore, partition: &'a str) -> Self {
        Self { store, partition }
    }

    /// The single Policy shared by the group, if any
    fn policy_for<'n>(
        &self,
        namespace: &str,
        names: impl Iterator<Item = &'n str>,
    ) -> Result<Option<Arc<Policy>>, ControllerError> {
        let mut chosen: Option<&str> = None;
        for name in names.filter(|n| !n.is_empty()) {
            match chosen {
                Some(existing) if existing != name => {
                    return Err(ControllerError::Logic(format!(
                        "more than one Policy in group: {} and {}",
                        existing, name
                    )));
                }
                _ => chosen = Some(name),
            }
        }
        match chosen {
            None => Ok(None),
            Some(name) => self
                .store
                .policy(namespace, name)
                .map(Some)
                .ok_or_else(|| ControllerError::Logic(format!("Policy {}/{} not found", namespace, name))),
        }
    }

    fn apply_policy(&self, rs: &mut ResourceConfig, policy: &Policy) {
        let spec = &policy.spec;
        let virtual_server = &mut rs.virtual_server;
        virtual_server.waf = spec.l7_policies.waf.clone();
        virtual_server.allow_vlans = spec.l3_policies.allow_vlans.clone();
        virtual_server.allow_source_range = spec.l3_policies.allow_source_range.clone();
        virtual_server.snat = spec.snat.clone();
        virtual_server.persistence_profile = spec.profiles.persistence_profile.clone();
        virtual_server.log_profiles = spec.profiles.log_profiles.clone();
        let irule = if virtual_server.is_secure {
            &spec.i_rules.secure
        } else {
            &spec.i_rules.insecure
        };
        if !irule.is_empty() {
            virtual_server.irules.push(irule.clone());
        }
        let profile = match virtual_server.ip_protocol.as_str() {
            "udp" => &spec.profiles.udp,
            _ => &spec.profiles.tcp,
        };
        if !profile.is_empty() {
            virtual_server.profiles.insert(self.profile_ref(profile, ALL_CONTEXTS));
        }
        if rs.meta.resource_type == ResourceType::VirtualServer && !spec.profiles.http.is_empty() {
            rs.virtual_server
                .profiles
                .insert(self.profile_ref(&spec.profiles.http, ALL_CONTEXTS));
        }
    }

    fn profile_ref(&self, name: &str, context: &str) -> ProfileRef {
        ProfileRef {
            name: name.to_string(),
            partition: self.partition.to_string(),
            context: context.to_string(),
        }
    }

    fn add_pool(&self, rs: &mut ResourceConfig, namespace: &str, pool: &crds::Pool) -> String {
        let name = pool_name(namespace, &pool.service, pool.service_port, &pool.node_member_label);
        if rs.pool_mut(&name).is_none() {
            let mut generated = Pool {
                name: name.clone(),
                partition: self.partition.to_string(),
                service_name: pool.service.clone(),
                service_port: pool.service_port,
                node_member_label: pool.node_member_label.clone(),
                members: Vec::new(),
                monitor_names: Vec::new(),
            };
            if let Some(monitor) = &pool.monitor {
                let mon_name = monitor_name(&name);
                if !rs.has_monitor(&mon_name) {
                    rs.monitors.push(Monitor {
                        name: mon_name.clone(),
                        partition: self.partition.to_string(),
                        type_: monitor.type_.clone(),
                        interval: monitor.interval,
                        timeout: monitor.timeout,
                        send: monitor.send.clone(),
                        recv: monitor.recv.clone(),
                        target_port: None,
                    });
                }
                generated.monitor_names.push(mon_name);
            }
            rs.pools.push(generated);
        }
        name
    }

    /// Listener for one port of a VirtualServer group
    pub fn virtual_server_config(
        &self,
        current: &VirtualServer,
        group: &[Arc<VirtualServer>],
        address: &str,
        port: VirtualPort,
    ) -> Result<ResourceConfig, ControllerError> {
        let namespace = current.namespace().unwrap_or_default();
        let name = listener_name(&current.spec.virtual_server_name, address, port.port);
        let mut rs = ResourceConfig::new(&name, self.partition, address, port.port, ResourceType::VirtualServer);
        rs.meta.namespace = namespace.clone();
        rs.meta.resource_name = current.name_any();
        rs.meta.protocol = port.protocol.to_string();
        rs.virtual_server.ip_protocol = "tcp".to_string();
        rs.virtual_server.is_secure = port.protocol == "https";
        rs.virtual_server.http_traffic = current.spec.http_traffic.clone();
        rs.virtual_server.source = "0.0.0.0/0".to_string();

        if let Some(policy) = self.policy_for(&namespace, group.iter().map(|vs| vs.spec.policy_name.as_str()))? {
            self.apply_policy(&mut rs, &policy);
        }

        let mut rules = Vec::new();
        for vs in group {
            debug!(virtual_server = %vs.name_any(), port = port.port, "Merging into {}", name);
            rs.add_host(&vs.spec.host);
            self.apply_overrides(&mut rs, vs);
            for pool in &vs.spec.pools {
                let pool_name = self.add_pool(&mut rs, &namespace, pool);
                rules.push(ForwardingRule {
                    name: format_name(&format!("vs_{}{}_{}", vs.spec.host, pool.path, pool_name)),
                    host: vs.spec.host.clone(),
                    path: pool.path.clone(),
                    pool: pool_name,
                    rewrite: pool.rewrite.clone(),
                });
            }
            if vs.is_tls() {
                let profile = self.tls_profile_for(vs)?;
                self.apply_tls(&mut rs, vs, &profile, port)?;
            }
        }
        if !rules.is_empty() {
            rs.policy = Some(PolicyFragment {
                name: format!("{}_policy", name),
                partition: self.partition.to_string(),
                rules,
            });
        }
        Ok(rs)
    }

    fn apply_overrides(&self, rs: &mut ResourceConfig, vs: &VirtualServer) {
        let virtual_server = &mut rs.virtual_server;
        if !vs.spec.snat.is_empty() {
            virtual_server.snat = vs.spec.snat.clone();
        }
        if !vs.spec.waf.is_empty() {
            virtual_server.waf = vs.spec.waf.clone();
        }
        if !vs.spec.persistence_profile.is_empty() {
            virtual_server.persistence_profile = vs.spec.persistence_profile.clone();
        }
        for vlan in &vs.spec.allow_vlans {
            if !virtual_server.allow_vlans.contains(vlan) {
                virtual_server.allow_vlans.push(vlan.clone());
            }
        }
        for irule in &vs.spec.i_rules {
            if !virtual_server.irules.contains(irule) {
                virtual_server.irules.push(irule.clone());
            }
        }
    }

    /// TLSProfile of `vs`, checked against its host
    fn tls_profile_for(&self, vs: &VirtualServer) -> Result<Arc<TLSProfile>, ControllerError> {
        let namespace = vs.namespace().unwrap_or_default();
        let profile = self
            .store
            .tls_profile(&namespace, &vs.spec.tls_profile_name)
            .ok_or_else(|| {
                ControllerError::Logic(format!(
                    "TLSProfile {}/{} not found",
                    namespace, vs.spec.tls_profile_name
                ))
            })?;
        if !vs.spec.host.is_empty() && !profile.matches_host(&vs.spec.host) {
            return Err(ControllerError::Logic(format!(
                "TLSProfile {} does not cover host {} of VirtualServer {}",
                vs.spec.tls_profile_name,
                vs.spec.host,
                vs.name_any()
            )));
        }
        Ok(profile)
    }

    fn apply_tls(
        &self,
        rs: &mut ResourceConfig,
        vs: &VirtualServer,
        profile: &TLSProfile,
        port: VirtualPort,
    ) -> Result<(), ControllerError> {
        let tls = &profile.spec.tls;
        let rs_name = rs.virtual_server.name.clone();

        if port.protocol == "http" {
            if vs.spec.http_traffic == HTTP_TRAFFIC_REDIRECT {
                let dg_name = format!("{}_https_redirect_dg", rs_name);
                let irule_name = format!("{}_redirect", rs_name);
                let dg = rs.data_groups.entry(dg_name.clone()).or_insert_with(|| DataGroup {
                    name: dg_name.clone(),
                    partition: self.partition.to_string(),
                    ..Default::default()
                });
                for pool in &vs.spec.pools {
                    let path = if pool.path.is_empty() { "/" } else { pool.path.as_str() };
                    dg.records
                        .insert(format!("{}{}", vs.spec.host, path), vs.https_port().to_string());
                }
                rs.irules.entry(irule_name.clone()).or_insert_with(|| IRule {
                    name: irule_name.clone(),
                    partition: self.partition.to_string(),
                    code: redirect_irule(&self.partition_path(&dg_name)),
                });
                if !rs.virtual_server.irules.contains(&irule_name) {
                    rs.virtual_server.irules.push(irule_name);
                }
            }
            return Ok(());
        }

        match tls.termination.as_str() {
            TLS_PASSTHROUGH => {
                let dg_name = format!("{}_ssl_passthrough_servername_dg", rs_name);
                let dg = rs.data_groups.entry(dg_name.clone()).or_insert_with(|| DataGroup {
                    name: dg_name.clone(),
                    partition: self.partition.to_string(),
                    ..Default::default()
                });
                if let Some(pool) = vs.spec.pools.first() {
                    let namespace = vs.namespace().unwrap_or_default();
                    dg.records.insert(
                        vs.spec.host.clone(),
                        pool_name(&namespace, &pool.service, pool.service_port, &pool.node_member_label),
                    );
                }
                Ok(())
            }
            _ => match tls.reference.as_str() {
                TLS_REFERENCE_BIGIP => {
                    if !tls.client_ssl.is_empty() {
                        rs.virtual_server
                            .profiles
                            .insert(self.profile_ref(&tls.client_ssl, CLIENT_SIDE));
                    }
                    if tls.termination == TLS_REENCRYPT && !tls.server_ssl.is_empty() {
                        rs.virtual_server
                            .profiles
                            .insert(self.profile_ref(&tls.server_ssl, SERVER_SIDE));
                    }
                    Ok(())
                }
                TLS_REFERENCE_SECRET => {
                    if !tls.client_ssl.is_empty() {
                        self.add_secret_profile(rs, vs, &tls.client_ssl, CLIENT_SIDE)?;
                    }
                    if tls.termination == TLS_REENCRYPT && !tls.server_ssl.is_empty() {
                        self.add_secret_profile(rs, vs, &tls.server_ssl, SERVER_SIDE)?;
                    }
                    Ok(())
                }
                other => Err(ControllerError::Logic(format!(
                    "TLSProfile {} has unsupported reference {:?}",
                    profile.name_any(),
                    other
                ))),
            },
        }
    }

    fn add_secret_profile(
        &self,
        rs: &mut ResourceConfig,
        vs: &VirtualServer,
        secret_name: &str,
        context: &str,
    ) -> Result<(), ControllerError> {
        let namespace = vs.namespace().unwrap_or_default();
        let secret = self.store.secret(&namespace, secret_name).ok_or_else(|| {
            ControllerError::Logic(format!("Secret {}/{} not found", namespace, secret_name))
        })?;
        let field = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|b| String::from_utf8_lossy(&b.0).into_owned())
        };
        let (Some(cert), Some(key)) = (field("tls.crt"), field("tls.key")) else {
            return Err(ControllerError::Logic(format!(
                "Secret {}/{} has no tls.crt/tls.key",
                namespace, secret_name
            )));
        };
        check_certificate(&cert, &key, &vs.spec.host).map_err(|e| {
            ControllerError::Logic(format!("Secret {}/{}: {}", namespace, secret_name, e))
        })?;
        let profile_name = format_name(&format!("{}_{}", namespace, secret_name));
        let secret_key = SecretKey {
            name: profile_name.clone(),
            resource_name: rs.virtual_server.name.clone(),
        };
        rs.custom_profiles.insert(
            secret_key,
            CustomProfile {
                name: profile_name.clone(),
                partition: self.partition.to_string(),
                context: context.to_string(),
                cert,
                key,
                server_name: vs.spec.host.clone(),
                sni_default: false,
            },
        );
        rs.virtual_server.profiles.insert(self.profile_ref(&profile_name, context));
        Ok(())
    }

    fn partition_path(&self, name: &str) -> String {
        format!("/{}/{}", self.partition, name)
    }

    /// Listener for a TransportServer at `address`
    pub fn transport_server_config(
        &self,
        ts: &TransportServer,
        group: &[Arc<TransportServer>],
        address: &str,
    ) -> Result<ResourceConfig, ControllerError> {
        let namespace = ts.namespace().unwrap_or_default();
        let port = ts.spec.virtual_server_port;
        let name = listener_name(&ts.spec.virtual_server_name, address, port);
        let mut rs = ResourceConfig::new(&name, self.partition, address, port, ResourceType::TransportServer);
        rs.meta.namespace = namespace.clone();
        rs.meta.resource_name = ts.name_any();
        rs.meta.protocol = ts.protocol().to_string();
        rs.virtual_server.ip_protocol = ts.protocol().to_string();
        rs.virtual_server.mode = if ts.spec.mode.is_empty() {
            "standard".to_string()
        } else {
            ts.spec.mode.clone()
        };
        rs.virtual_server.source = "0.0.0.0/0".to_string();
        rs.virtual_server.translate_server_address = true;
        rs.virtual_server.translate_server_port = true;

        if let Some(policy) = self.policy_for(&namespace, group.iter().map(|t| t.spec.policy_name.as_str()))? {
            self.apply_policy(&mut rs, &policy);
        }
        if !ts.spec.snat.is_empty() {
            rs.virtual_server.snat = ts.spec.snat.clone();
        }
        if rs.virtual_server.snat.is_empty() {
            rs.virtual_server.snat = DEFAULT_SNAT.to_string();
        }
        if !ts.spec.persistence_profile.is_empty() {
            rs.virtual_server.persistence_profile = ts.spec.persistence_profile.clone();
        }
        rs.virtual_server.irules.extend(ts.spec.i_rules.iter().cloned());
        rs.virtual_server.allow_vlans.extend(ts.spec.allow_vlans.iter().cloned());

        let pool = self.add_pool(&mut rs, &namespace, &ts.spec.pool);
        rs.virtual_server.pool_name = pool;
        Ok(rs)
    }

    /// Listener for one port of a LoadBalancer Service
    pub fn lb_service_config(&self, svc: &Service, address: &str, port: &ServicePort) -> ResourceConfig {
        let namespace = svc.namespace().unwrap_or_default();
        let svc_name = svc.name_any();
        let name = lb_service_name(&namespace, &svc_name, address, port.port);
        let mut rs = ResourceConfig::new(&name, self.partition, address, port.port, ResourceType::LoadBalancerService);
        let protocol = port
            .protocol
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_else(|| "tcp".to_string());
        rs.meta.namespace = namespace.clone();
        rs.meta.resource_name = svc_name.clone();
        rs.meta.protocol = protocol.clone();
        rs.virtual_server.ip_protocol = protocol;
        rs.virtual_server.mode = "standard".to_string();
        rs.virtual_server.source = "0.0.0.0/0".to_string();
        rs.virtual_server.snat = DEFAULT_SNAT.to_string();
        rs.virtual_server.translate_server_address = true;
        rs.virtual_server.translate_server_port = true;

        let pool = pool_name(&namespace, &svc_name, port.port, "");
        rs.pools.push(Pool {
            name: pool.clone(),
            partition: self.partition.to_string(),
            service_name: svc_name,
            service_port: port.port,
            ..Default::default()
        });
        rs.virtual_server.pool_name = pool;
        rs
    }

    /// Listener for one port of the ingress controller behind an IngressLink
    pub fn ingress_link_config(
        &self,
        il: &IngressLink,
        svc: &Service,
        address: &str,
        port: &ServicePort,
        monitor_port: i32,
    ) -> ResourceConfig {
        let svc_namespace = svc.namespace().unwrap_or_default();
        let svc_name = svc.name_any();
        let name = ingress_link_name(address, port.port);
        let mut rs = ResourceConfig::new(&name, self.partition, address, port.port, ResourceType::IngressLink);
        rs.meta.namespace = il.namespace().unwrap_or_default();
        rs.meta.resource_name = il.name_any();
        rs.meta.protocol = "tcp".to_string();
        rs.add_host(&il.spec.host);
        rs.virtual_server.ip_protocol = "tcp".to_string();
        rs.virtual_server.mode = "standard".to_string();
        rs.virtual_server.source = "0.0.0.0/0".to_string();
        rs.virtual_server.snat = DEFAULT_SNAT.to_string();
        rs.virtual_server.translate_server_address = true;
        rs.virtual_server.translate_server_port = true;
        rs.virtual_server.irules = il.spec.i_rules.clone();

        let pool = pool_name(&svc_namespace, &svc_name, port.port, "");
        let monitor = monitor_name(&pool);
        rs.monitors.push(Monitor {
            name: monitor.clone(),
            partition: self.partition.to_string(),
            type_: "http".to_string(),
            interval: 20,
            timeout: 10,
            send: "GET /nginx-ready HTTP/1.1\r\n".to_string(),
            recv: String::new(),
            target_port: Some(monitor_port),
        });
        rs.pools.push(Pool {
            name: pool.clone(),
            partition: self.partition.to_string(),
            service_name: svc_name,
            service_port: port.port,
            monitor_names: vec![monitor],
            ..Default::default()
        });
        rs.virtual_server.pool_name = pool;
        rs
    }

    /// Wide-IP for an ExternalDNS resource over the current listeners
    pub fn wide_ip(&self, edns: &ExternalDNS, resources: &ResourceMap) -> WideIP {
        let spec = &edns.spec;
        let or_default = |value: &str, default: &str| {
            if value.is_empty() {
                default.to_string()
            } else {
                value.to_string()
            }
        };
        let mut wide_ip = WideIP {
            domain_name: spec.domain_name.clone(),
            record_type: or_default(&spec.dns_record_type, DEFAULT_RECORD_TYPE),
            lb_method: or_default(&spec.load_balance_method, DEFAULT_LB_METHOD),
            pools: Vec::new(),
        };
        let pool_name = format!("{}_{}", spec.domain_name, creation_stamp(edns));

        for dns_pool in &spec.pools {
            let members = resources
                .iter()
                .filter(|(_, rs)| rs.meta.hosts.iter().any(|h| *h == spec.domain_name))
                .filter(|(_, rs)| {
                    rs.virtual_server.is_secure || rs.virtual_server.http_traffic != HTTP_TRAFFIC_REDIRECT
                })
                .map(|(name, _)| format!("{}:/{}/Shared/{}", dns_pool.data_server_name, self.partition, name))
                .collect();
            let monitor = dns_pool
                .monitor
                .as_ref()
                .filter(|m| !m.type_.is_empty())
                .map(|m| {
                    let http = m.type_ == "http" || m.type_ == "https";
                    Monitor {
                        name: monitor_name(&pool_name),
                        partition: COMMON_PARTITION.to_string(),
                        type_: m.type_.clone(),
                        interval: m.interval,
                        timeout: m.timeout,
                        send: if http { m.send.clone() } else { String::new() },
                        recv: if http { m.recv.clone() } else { String::new() },
                        target_port: None,
                    }
                });
            wide_ip.pools.push(GslbPool {
                name: pool_name.clone(),
                record_type: or_default(&dns_pool.dns_record_type, DEFAULT_RECORD_TYPE),
                lb_method: or_default(&dns_pool.load_balance_method, DEFAULT_LB_METHOD),
                members,
                monitor,
            });
        }
        wide_ip
    }
}

/// Creation timestamp in RFC 3339 with ':' replaced by '-'
fn creation_stamp(edns: &ExternalDNS) -> String {
    edns.metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| serde_json::to_value(t).ok())
        .and_then(|v| v.as_str().map(|s| s.replace(':', "-")))
        .unwrap_or_default()
}

fn redirect_irule(data_group: &str) -> String {
    format!(
        r#"when HTTP_REQUEST {{
    set host [string tolower [HTTP::host]]
    set path [HTTP::path]
    set port [class match -value "$host$path" starts_with {dg}]
    if {{ $port eq "" }} {{
        set port [class match -value "$host/" starts_with {dg}]
    }}
    if {{ $port ne "" }} {{
        HTTP::redirect https://[getfield [HTTP::host] ":" 1]:$port[HTTP::uri]
    }}
}}"#,
        dg = data_group
    )
}
