//! Service Registry Integration Tests
//!
//! Health probing, the error threshold and the circuit it opens.

mod common;

use std::sync::Arc;
use std::time::Duration;

use hazardflow::adapters::HttpTransport;
use hazardflow::core::{HealthSettings, ServiceRegistry};
use hazardflow::domain::{ErrorKind, ServiceEndpoint, ServiceStatus};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{client, open_circuit, registry, ScriptedTransport};

#[tokio::test]
async fn test_error_threshold_opens_circuit() {
    let transport = ScriptedTransport::new();
    transport.set_healthy("a", true);
    transport.set_healthy("b", false);
    let registry = registry(Arc::clone(&transport), &["a", "b"]);

    let first = registry.probe_all().await;
    assert_eq!(first["a"], ServiceStatus::Healthy);
    assert_eq!(first["b"], ServiceStatus::Degraded);

    registry.probe_all().await;
    let third = registry.probe_all().await;
    assert_eq!(third["a"], ServiceStatus::Healthy);
    assert_eq!(third["b"], ServiceStatus::Unhealthy);

    let b = registry.endpoint("b").unwrap();
    assert_eq!(b.error_count, 3);
    assert!(b.is_circuit_open());
    assert!(b.last_check.is_some());
}

#[tokio::test]
async fn test_open_circuit_makes_no_network_call() {
    let transport = ScriptedTransport::new();
    transport.complete_with("b", json!({"risk_score": 0.2}));
    let registry = registry(Arc::clone(&transport), &["b"]);
    open_circuit(&registry, &transport, "b").await;

    let call = client(&registry).invoke("b", "flood_risk", json!({}), None).await;

    assert!(!call.success);
    assert_eq!(call.error_kind(), Some(ErrorKind::ServiceUnavailable));
    assert_eq!(transport.execute_calls("b"), 0);
}

#[tokio::test]
async fn test_successful_probe_closes_circuit() {
    let transport = ScriptedTransport::new();
    transport.complete_with("b", json!({"risk_score": 0.2}));
    let registry = registry(Arc::clone(&transport), &["b"]);
    open_circuit(&registry, &transport, "b").await;
    assert_eq!(registry.status("b"), Some(ServiceStatus::Unhealthy));

    transport.set_healthy("b", true);
    assert_eq!(registry.probe("b").await, Some(ServiceStatus::Healthy));
    assert_eq!(registry.endpoint("b").unwrap().error_count, 0);

    let call = client(&registry).invoke("b", "flood_risk", json!({}), None).await;
    assert!(call.success);
    assert_eq!(transport.execute_calls("b"), 1);
}

#[tokio::test]
async fn test_probe_unknown_service() {
    let transport = ScriptedTransport::new();
    let registry = registry(transport, &["a"]);

    assert_eq!(registry.probe("missing").await, None);
    assert!(registry.snapshot().contains_key("a"));
    assert!(!registry.snapshot().contains_key("missing"));
}

#[tokio::test]
async fn test_call_outcomes_feed_health() {
    let transport = ScriptedTransport::new();
    let registry = registry(transport, &["a"]);

    registry.record_call("a", Duration::from_millis(5), Some(ErrorKind::Transport));
    assert_eq!(registry.status("a"), Some(ServiceStatus::Degraded));

    // Cancellation says nothing about the service
    registry.record_call("a", Duration::from_millis(5), Some(ErrorKind::Cancelled));
    assert_eq!(registry.endpoint("a").unwrap().error_count, 1);

    // The tool failed, but the service answered
    registry.record_call("a", Duration::from_millis(5), Some(ErrorKind::RemoteExecution));
    assert_eq!(registry.status("a"), Some(ServiceStatus::Healthy));
    assert_eq!(registry.endpoint("a").unwrap().error_count, 0);
    assert_eq!(registry.endpoint("a").unwrap().last_latency_ms, Some(5));
}

#[tokio::test]
async fn test_health_monitor_lifecycle() {
    let transport = ScriptedTransport::new();
    transport.set_healthy("a", true);
    let registry = registry(Arc::clone(&transport), &["a"]);

    assert!(registry.start_health_monitor());
    assert!(!registry.start_health_monitor());
    assert!(registry.is_monitoring());

    // The first round runs immediately
    for _ in 0..100 {
        if transport.health_calls("a") > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(transport.health_calls("a") >= 1);
    assert_eq!(registry.status("a"), Some(ServiceStatus::Healthy));

    assert!(registry.stop_health_monitor().await);
    assert!(!registry.is_monitoring());
    assert!(!registry.stop_health_monitor().await);
}

#[tokio::test]
async fn test_http_probe() {
    let up = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&up)
        .await;

    let down = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&down)
        .await;

    let registry = ServiceRegistry::with_endpoints(
        Arc::new(HttpTransport::new()),
        HealthSettings::default(),
        [
            ServiceEndpoint::new("nfdrs4", up.uri()),
            ServiceEndpoint::new("lisflood", down.uri()).with_error_threshold(1),
        ],
    )
    .unwrap();

    let statuses = registry.probe_all().await;
    assert_eq!(statuses["nfdrs4"], ServiceStatus::Healthy);
    assert_eq!(statuses["lisflood"], ServiceStatus::Unhealthy);
    assert!(registry.endpoint("nfdrs4").unwrap().last_latency_ms.is_some());
}

#[test]
fn test_register_rejects_empty_address() {
    let registry = ServiceRegistry::new(Arc::new(HttpTransport::new()), HealthSettings::default());

    assert!(registry.register(ServiceEndpoint::new("", "http://localhost:1")).is_err());
    assert!(registry.register(ServiceEndpoint::new("a", "")).is_err());
    assert!(registry.is_empty());

    registry.register(ServiceEndpoint::new("a", "http://localhost:1")).unwrap();
    assert_eq!(registry.names(), vec!["a".to_string()]);
    assert!(registry.deregister("a"));
    assert!(!registry.deregister("a"));
}
