//! Integration tests for the agent API endpoints

#[allow(dead_code)]
#[path = "../src/api.rs"]
mod api;

use api::{create_router, AppState};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use noc_agent_lib::collector::{BackoffPolicy, DeviceRegistry};
use noc_agent_lib::health::components;
use noc_agent_lib::pipeline::{BusConfig, Pipeline};
use noc_agent_lib::{
    CollectorMetrics, Device, DeviceKind, HealthRegistry, StatusHandle, StructuredLogger,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>, DeviceRegistry) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::EVENT_BUS).await;

    let pipeline = Pipeline::new(
        BusConfig::default(),
        CollectorMetrics::new(),
        StructuredLogger::new("test-node"),
    );
    let registry = DeviceRegistry::new(BackoffPolicy::default());
    let status = StatusHandle::new("test-node", registry.clone(), pipeline);

    let state = Arc::new(AppState::new(health_registry, status));
    (create_router(state.clone()), state, registry)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _, _) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert!(json["components"]["scheduler"].is_object());
}

#[tokio::test]
async fn test_healthz_ok_when_degraded_unavailable_when_unhealthy() {
    let (app, state, _) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::EVENT_BUS, "3 events dropped under backpressure")
        .await;
    let (status, body) = get(app.clone(), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "degraded");

    state
        .health_registry
        .set_unhealthy(components::SCHEDULER, "stopped")
        .await;
    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_ready_flag() {
    let (app, state, _) = setup_test_app().await;

    let (status, _) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    state.health_registry.set_ready(true).await;
    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_exports_collector_metrics() {
    let (app, _, _) = setup_test_app().await;
    CollectorMetrics::new().inc_polls_skipped();

    let (status, body) = get(app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("noc_agent_polls_skipped_total"));
}

#[tokio::test]
async fn test_status_lists_devices() {
    let (app, _, registry) = setup_test_app().await;
    registry
        .add(
            Device::new("core-r1", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), DeviceKind::Router),
            Utc::now(),
        )
        .await;

    let (status, body) = get(app, "/status").await;
    assert_eq!(status, StatusCode::OK);

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["node"], "test-node");
    assert_eq!(json["devices"][0]["id"], "core-r1");
    assert_eq!(json["devices"][0]["health"], "unknown");
    assert_eq!(json["devices"][0]["active"], true);
    assert_eq!(json["counters"]["samples_produced"], 0);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let (app, _, _) = setup_test_app().await;

    let (status, _) = get(app, "/devices").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
