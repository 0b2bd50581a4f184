//! Unit tests for VirtualServer reconciliation

#[cfg(test)]
mod tests {
    use crate::config::ControllerConfig;
    use crate::error::ControllerError;
    use crate::events::reasons;
    use crate::resource::{Resource, WorkItem};
    use crate::resource_config::PoolMember;
    use crate::telemetry::CounterKind;
    use crate::test_utils::*;
    use crds::VirtualServer;
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    fn vs_item(vs: &VirtualServer, delete: bool) -> WorkItem {
        WorkItem::new(Resource::VirtualServer(Arc::new(vs.clone())), delete)
    }

    /// Harness with one node and NodePort Services `web` and `api` primed
    async fn primed(config: ControllerConfig) -> Harness {
        let mut h = Harness::new(config);
        h.store.add_node("node-a", "192.168.0.10", &[]);
        for (name, node_port) in [("web", 30080), ("api", 30081)] {
            let svc = service("apps", name, "NodePort", &[(80, 8080, node_port)]);
            h.store.add_service(svc.clone());
            h.reconciler
                .reconcile(&WorkItem::new(Resource::Service(Arc::new(svc)), false))
                .await
                .unwrap();
        }
        h
    }

    async fn apply(h: &mut Harness, vs: &VirtualServer) -> Result<(), ControllerError> {
        h.store.add_virtual_server(vs.clone());
        h.reconciler.reconcile(&vs_item(vs, false)).await
    }

    async fn delete(h: &mut Harness, vs: &VirtualServer) -> Result<(), ControllerError> {
        h.store.remove_virtual_server("apps", &vs.metadata.name.clone().unwrap_or_default());
        h.reconciler.reconcile(&vs_item(vs, true)).await
    }

    #[tokio::test]
    async fn test_group_shares_listener_until_last_member_is_deleted() {
        let mut h = primed(ControllerConfig::default()).await;
        let a = virtual_server("apps", "a", "foo.com", "1.1.1.1", &[("/", "web", 80)]);
        let b = virtual_server("apps", "b", "foo.com", "1.1.1.1", &[("/api", "api", 80)]);

        apply(&mut h, &a).await.unwrap();
        apply(&mut h, &b).await.unwrap();
        assert_eq!(h.listener_names(), vec!["crd_1_1_1_1_80"]);
        let rs = &h.reconciler.resources()["crd_1_1_1_1_80"];
        assert_eq!(rs.pools.len(), 2);
        assert_eq!(rs.pools[0].members, vec![PoolMember::new("192.168.0.10", 30080)]);
        assert_eq!(rs.pools[1].members, vec![PoolMember::new("192.168.0.10", 30081)]);
        assert!(rs.meta.active);
        assert!(h
            .status
            .writes()
            .contains(&StatusWrite::VirtualServer("apps/a".to_string(), "1.1.1.1".to_string())));
        assert_eq!(h.telemetry.get(CounterKind::VirtualServer, "apps"), 2);

        // The surviving member takes over the listener
        delete(&mut h, &a).await.unwrap();
        let rs = &h.reconciler.resources()["crd_1_1_1_1_80"];
        assert_eq!(rs.pools.len(), 1);
        assert_eq!(rs.pools[0].service_name, "api");
        assert_eq!(rs.meta.resource_name, "b");

        delete(&mut h, &b).await.unwrap();
        assert!(h.listener_names().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_path_is_served_by_earlier_member() {
        let mut h = primed(ControllerConfig::default()).await;
        let first = virtual_server("apps", "first", "foo.com", "1.1.1.1", &[("/", "web", 80)]);
        let second = virtual_server("apps", "second", "foo.com", "1.1.1.1", &[("/", "api", 80)]);

        apply(&mut h, &first).await.unwrap();
        apply(&mut h, &second).await.unwrap();

        let rs = &h.reconciler.resources()["crd_1_1_1_1_80"];
        assert_eq!(rs.pools.len(), 1);
        assert_eq!(rs.pools[0].service_name, "web");
    }

    #[tokio::test]
    async fn test_address_conflict_blanks_the_group() {
        let mut h = primed(ControllerConfig::default()).await;
        let a = virtual_server("apps", "a", "foo.com", "1.1.1.1", &[("/", "web", 80)]);
        apply(&mut h, &a).await.unwrap();
        assert_eq!(h.listener_names(), vec!["crd_1_1_1_1_80"]);

        let b = virtual_server("apps", "b", "foo.com", "2.2.2.2", &[("/api", "api", 80)]);
        let err = apply(&mut h, &b).await.unwrap_err();

        assert!(matches!(err, ControllerError::Conflict(_)));
        assert!(!err.is_retryable());
        assert!(h.listener_names().is_empty());
        assert_eq!(h.events.reasons(), vec![reasons::GROUP_CONFLICT.to_string()]);
        assert_eq!(h.events.events()[0].object, "apps/b");
    }

    #[tokio::test]
    async fn test_reprocessing_is_idempotent() {
        let mut h = primed(ControllerConfig::default()).await;
        let a = virtual_server("apps", "a", "foo.com", "1.1.1.1", &[("/", "web", 80)]);

        apply(&mut h, &a).await.unwrap();
        let before = h.reconciler.resources().clone();
        apply(&mut h, &a).await.unwrap();

        assert_eq!(h.reconciler.resources(), &before);
    }

    #[tokio::test]
    async fn test_invalid_http_traffic_is_rejected() {
        let mut h = primed(ControllerConfig::default()).await;
        let mut a = virtual_server("apps", "a", "foo.com", "1.1.1.1", &[("/", "web", 80)]);
        a.spec.http_traffic = "sometimes".to_string();

        let err = apply(&mut h, &a).await.unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
        assert!(h.listener_names().is_empty());
    }

    #[tokio::test]
    async fn test_missing_address_without_leasing_is_rejected() {
        let mut h = primed(ControllerConfig::default()).await;
        let a = virtual_server("apps", "a", "foo.com", "", &[("/", "web", 80)]);

        let err = apply(&mut h, &a).await.unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_new_listener_refreshes_wide_ip() {
        let mut h = primed(ControllerConfig::default()).await;
        h.store.add_external_dns(external_dns("apps", "foo", "foo.com", "dc1", None));
        let a = virtual_server("apps", "a", "foo.com", "1.1.1.1", &[("/", "web", 80)]);

        apply(&mut h, &a).await.unwrap();

        let wide_ip = &h.reconciler.dns_config()["foo.com"];
        assert_eq!(wide_ip.pools[0].members, vec!["dc1:/lbops/Shared/crd_1_1_1_1_80"]);
    }

    #[tokio::test]
    async fn test_lease_is_requested_then_listener_follows_allocation() {
        let mut h = primed(ipam_config()).await;
        let mut a = virtual_server("apps", "a", "foo.com", "", &[("/", "web", 80)]);
        a.spec.ipam_label = "prod".to_string();

        // Execute: first pass only files the request
        apply(&mut h, &a).await.unwrap();
        assert!(h.listener_names().is_empty());
        let specs = h.leases.host_specs(IPAM_NAMESPACE, IPAM_NAME);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].host, "foo.com");
        assert_eq!(specs[0].ipam_label, "prod");

        // Execute: the allocator answers and the lease object change fans out
        h.allocate_host("foo.com", "prod", "10.0.0.5");
        let ipam = Arc::new(h.ipam_object());
        h.reconciler
            .reconcile(&WorkItem::new(Resource::Ipam(ipam), false))
            .await
            .unwrap();

        assert_eq!(h.listener_names(), vec!["crd_10_0_0_5_80"]);
        assert!(h
            .status
            .writes()
            .contains(&StatusWrite::VirtualServer("apps/a".to_string(), "10.0.0.5".to_string())));
        assert_eq!(h.telemetry.get(CounterKind::IpamVirtualServer, IPAM_NAMESPACE), 1);

        // Execute: deleting the last member releases the lease
        delete(&mut h, &a).await.unwrap();
        assert!(h.listener_names().is_empty());
        assert!(h.leases.host_specs(IPAM_NAMESPACE, IPAM_NAME).is_empty());
    }

    #[tokio::test]
    async fn test_relabel_moves_listener_to_new_allocation() {
        let mut h = primed(ipam_config()).await;
        let mut a = virtual_server("apps", "a", "foo.com", "", &[("/", "web", 80)]);
        a.spec.ipam_label = "prod".to_string();
        apply(&mut h, &a).await.unwrap();
        h.allocate_host("foo.com", "prod", "10.0.0.5");
        apply(&mut h, &a).await.unwrap();
        assert_eq!(h.listener_names(), vec!["crd_10_0_0_5_80"]);

        a.spec.ipam_label = "dev".to_string();
        apply(&mut h, &a).await.unwrap();
        let specs = h.leases.host_specs(IPAM_NAMESPACE, IPAM_NAME);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].ipam_label, "dev");

        h.allocate_host("foo.com", "dev", "10.0.1.1");
        apply(&mut h, &a).await.unwrap();
        assert_eq!(h.listener_names(), vec!["crd_10_0_1_1_80"]);
    }

    #[tokio::test]
    async fn test_namespace_delete_removes_whole_group() {
        let mut h = primed(ControllerConfig::default()).await;
        let a = virtual_server("apps", "a", "foo.com", "1.1.1.1", &[("/", "web", 80)]);
        let b = virtual_server("apps", "b", "foo.com", "1.1.1.1", &[("/api", "api", 80)]);
        apply(&mut h, &a).await.unwrap();
        apply(&mut h, &b).await.unwrap();

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("apps".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        h.reconciler
            .reconcile(&WorkItem::new(Resource::Namespace(Arc::new(ns)), true))
            .await
            .unwrap();

        assert!(h.listener_names().is_empty());
    }
}
