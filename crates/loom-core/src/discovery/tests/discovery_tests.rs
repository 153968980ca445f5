use std::sync::Arc;

use crate::discovery::{
    DiscoveryError, DiscoveryPublisher, InMemoryServiceRegistry, ServiceInfo, ServiceRegistry,
};

#[test]
fn test_service_info_builder() {
    let info = ServiceInfo::new("10.0.0.5:9000")
        .tag("grpc")
        .tag("v2")
        .meta("zone", "eu-1");
    assert_eq!(info.address, "10.0.0.5:9000");
    assert_eq!(info.tags, vec!["grpc", "v2"]);
    assert_eq!(info.meta.get("zone").map(String::as_str), Some("eu-1"));
}

#[tokio::test]
async fn test_in_memory_registry() {
    let registry = InMemoryServiceRegistry::new();
    let orders = ServiceInfo::new("127.0.0.1:1");
    registry.register("orders", &orders).await.unwrap();
    assert_eq!(registry.services().await, vec!["orders"]);

    match registry.register("broken", &ServiceInfo::default()).await {
        Err(DiscoveryError::Rejected { service, .. }) => assert_eq!(service, "broken"),
        other => panic!("expected Rejected, got {:?}", other),
    }

    registry.set_reachable(false);
    assert!(matches!(
        registry.deregister("orders").await,
        Err(DiscoveryError::Unreachable { .. })
    ));
    registry.set_reachable(true);
    registry.deregister("orders").await.unwrap();
    assert!(registry.get("orders").await.is_none());
}

#[tokio::test]
async fn test_publisher_without_client_is_a_no_op() {
    let publisher = DiscoveryPublisher::new(None);
    assert!(!publisher.is_enabled());
    assert!(!publisher.publish("svc", ServiceInfo::new("x:1")).await);
    publisher.withdraw("svc").await;
    assert!(publisher.published().await.is_empty());
}

#[tokio::test]
async fn test_publisher_tracks_accepted_registrations() {
    let registry = Arc::new(InMemoryServiceRegistry::new());
    let publisher = DiscoveryPublisher::new(Some(registry.clone() as Arc<dyn ServiceRegistry>));
    assert!(publisher.is_enabled());

    let api = ServiceInfo::new("127.0.0.1:80");
    assert!(publisher.publish("api", api).await);
    assert!(!publisher.publish("bad", ServiceInfo::default()).await);
    let published = publisher.published().await;
    assert_eq!(published.keys().collect::<Vec<_>>(), vec!["api"]);

    registry.set_reachable(false);
    let later = ServiceInfo::new("127.0.0.1:81");
    assert!(!publisher.publish("later", later).await);

    // Withdrawal while unreachable is logged; the local record is dropped either way.
    publisher.withdraw("api").await;
    assert!(publisher.published().await.is_empty());
    assert!(registry.get("api").await.is_some());
}
