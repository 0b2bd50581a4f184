//! Unit tests for Service, LoadBalancer Service and lease fan-out handling

#[cfg(test)]
mod tests {
    use crate::config::ControllerConfig;
    use crate::error::ControllerError;
    use crate::events::{reasons, Severity};
    use crate::reconciler::service::IPAM_LABEL_ANNOTATION;
    use crate::resource::{Resource, WorkItem};
    use crate::resource_config::PoolMember;
    use crate::telemetry::CounterKind;
    use crate::test_utils::*;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Service, ServiceStatus};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const LB_LISTENER: &str = "vs_lb_svc_apps_web_10_0_0_9_80";

    fn lb_service(label: Option<&str>) -> Service {
        let mut svc = service("apps", "web", "LoadBalancer", &[(80, 8080, 30080)]);
        if let Some(label) = label {
            svc.metadata.annotations = Some(BTreeMap::from([(
                IPAM_LABEL_ANNOTATION.to_string(),
                label.to_string(),
            )]));
        }
        svc
    }

    fn with_ingress(mut svc: Service, ip: &str) -> Service {
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some(ip.to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        svc
    }

    async fn apply(h: &mut Harness, svc: &Service) -> Result<(), ControllerError> {
        h.store.add_service(svc.clone());
        h.reconciler
            .reconcile(&WorkItem::new(Resource::Service(Arc::new(svc.clone())), false))
            .await
    }

    async fn lease_changed(h: &mut Harness) -> Result<(), ControllerError> {
        let ipam = Arc::new(h.ipam_object());
        h.reconciler.reconcile(&WorkItem::new(Resource::Ipam(ipam), false)).await
    }

    #[tokio::test]
    async fn test_lb_service_waits_for_allocation_then_publishes_ingress() {
        let mut h = Harness::new(ipam_config());
        h.store.add_node("node-a", "192.168.0.10", &[]);
        let svc = lb_service(Some("prod"));

        apply(&mut h, &svc).await.unwrap();
        assert!(h.listener_names().is_empty());
        let specs = h.leases.host_specs(IPAM_NAMESPACE, IPAM_NAME);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].key, "apps/web_svc");

        h.allocate_key("apps/web_svc", "prod", "10.0.0.9");
        lease_changed(&mut h).await.unwrap();

        assert_eq!(h.listener_names(), vec![LB_LISTENER]);
        let rs = &h.reconciler.resources()[LB_LISTENER];
        assert_eq!(rs.pools[0].members, vec![PoolMember::new("192.168.0.10", 30080)]);
        assert_eq!(
            h.status.writes(),
            vec![StatusWrite::ServiceIngress("apps/web".to_string(), vec!["10.0.0.9".to_string()])]
        );
        let events = h.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Normal);
        assert_eq!(events[0].reason, reasons::EXTERNAL_IP);
        assert_eq!(h.telemetry.get(CounterKind::IpamLoadBalancerService, IPAM_NAMESPACE), 1);
    }

    #[tokio::test]
    async fn test_lb_service_delete_releases_and_clears_ingress() {
        let mut h = Harness::new(ipam_config());
        let svc = lb_service(Some("prod"));
        apply(&mut h, &svc).await.unwrap();
        h.allocate_key("apps/web_svc", "prod", "10.0.0.9");
        apply(&mut h, &svc).await.unwrap();
        assert_eq!(h.listener_names(), vec![LB_LISTENER]);

        // The cached object carries the ingress written on allocation
        let svc = with_ingress(svc, "10.0.0.9");
        h.store.remove_service("apps", "web");
        h.reconciler
            .reconcile(&WorkItem::new(Resource::Service(Arc::new(svc)), true))
            .await
            .unwrap();

        assert!(h.listener_names().is_empty());
        assert!(h.leases.host_specs(IPAM_NAMESPACE, IPAM_NAME).is_empty());
        assert_eq!(
            h.status.writes().last(),
            Some(&StatusWrite::ServiceIngress("apps/web".to_string(), vec![]))
        );
        assert!(h.events.events().last().is_some_and(|e| e.message.contains("Removed")));
    }

    #[tokio::test]
    async fn test_lb_service_without_label_is_rejected() {
        let mut h = Harness::new(ipam_config());
        let err = apply(&mut h, &lb_service(None)).await.unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
        assert!(h.leases.host_specs(IPAM_NAMESPACE, IPAM_NAME).is_empty());
    }

    #[tokio::test]
    async fn test_lb_service_ignored_without_leasing() {
        let mut h = Harness::new(ControllerConfig::default());
        apply(&mut h, &lb_service(Some("prod"))).await.unwrap();
        assert!(h.listener_names().is_empty());
        assert!(h.status.writes().is_empty());
    }

    #[tokio::test]
    async fn test_type_change_releases_on_next_lease_update() {
        let mut h = Harness::new(ipam_config());
        let svc = lb_service(Some("prod"));
        apply(&mut h, &svc).await.unwrap();
        h.allocate_key("apps/web_svc", "prod", "10.0.0.9");
        lease_changed(&mut h).await.unwrap();
        assert_eq!(h.listener_names(), vec![LB_LISTENER]);

        let mut cluster_ip = with_ingress(svc, "10.0.0.9");
        cluster_ip.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_string());
        apply(&mut h, &cluster_ip).await.unwrap();
        lease_changed(&mut h).await.unwrap();

        assert!(h.listener_names().is_empty());
        assert!(h.leases.host_specs(IPAM_NAMESPACE, IPAM_NAME).is_empty());
        assert_eq!(
            h.status.writes().last(),
            Some(&StatusWrite::ServiceIngress("apps/web".to_string(), vec![]))
        );
    }

    #[tokio::test]
    async fn test_ingress_controller_change_rebuilds_ingress_link() {
        let mut h = Harness::new(ControllerConfig::default());
        h.store.add_node("node-a", "192.168.0.10", &[]);
        let mut svc = service("nginx", "nginx-ingress", "NodePort", &[(443, 443, 30443), (8081, 8081, 30081)]);
        svc.metadata.labels = Some(BTreeMap::from([("app".to_string(), "nginx".to_string())]));
        let il = ingress_link("apps", "il", "10.1.1.1", &[("app", "nginx")]);
        h.store.add_ingress_link(il.clone());

        apply(&mut h, &svc).await.unwrap();

        assert_eq!(h.listener_names(), vec!["ingress_link_crd_10_1_1_1_443"]);
        let rs = &h.reconciler.resources()["ingress_link_crd_10_1_1_1_443"];
        assert_eq!(rs.pools[0].members, vec![PoolMember::new("192.168.0.10", 30443)]);
        assert_eq!(rs.monitors[0].target_port, Some(30081));
        assert!(h
            .status
            .writes()
            .contains(&StatusWrite::IngressLink("apps/il".to_string(), "10.1.1.1".to_string())));

        // Execute: the IngressLink goes away and takes its listeners along
        h.reconciler
            .reconcile(&WorkItem::new(Resource::IngressLink(Arc::new(il)), true))
            .await
            .unwrap();
        assert!(h.listener_names().is_empty());
    }

    #[tokio::test]
    async fn test_empty_selector_is_rejected() {
        let mut h = Harness::new(ControllerConfig::default());
        let il = ingress_link("apps", "il", "10.1.1.1", &[]);
        let err = h
            .reconciler
            .reconcile(&WorkItem::new(Resource::IngressLink(Arc::new(il)), false))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
    }
}
