//! ExternalDNS reconciliation.

use super::Reconciler;
use crate::telemetry::CounterKind;
use crds::ExternalDNS;
use kube::ResourceExt;
use tracing::debug;

impl Reconciler {
    /// Rebuild (or drop) the wide-IP of one ExternalDNS resource
    pub(crate) fn process_external_dns(&mut self, edns: &ExternalDNS, deleted: bool) {
        let namespace = edns.namespace().unwrap_or_default();
        let domain = &edns.spec.domain_name;
        if deleted {
            if self.dns_config.remove(domain).is_some() {
                debug!(domain = %domain, "Removed wide-IP");
            }
            self.telemetry.decrement(CounterKind::ExternalDns, &namespace);
            return;
        }

        self.telemetry
            .set(CounterKind::ExternalDns, &namespace, self.store.external_dns(&namespace).len());
        let wide_ip = self.builder().wide_ip(edns, &self.resources);
        debug!(
            domain = %domain,
            members = wide_ip.pools.iter().map(|p| p.members.len()).sum::<usize>(),
            "Built wide-IP"
        );
        self.dns_config.insert(domain.clone(), wide_ip);
    }

    /// Refresh wide-IPs whose domain is served by a newly created listener
    pub(crate) fn process_associated_external_dns(&mut self, hosts: &[String]) {
        let matching: Vec<_> = self
            .monitored(|ns| self.store.external_dns(ns))
            .into_iter()
            .filter(|edns| hosts.iter().any(|h| *h == edns.spec.domain_name))
            .collect();
        for edns in matching {
            self.process_external_dns(&edns, false);
        }
    }
}
