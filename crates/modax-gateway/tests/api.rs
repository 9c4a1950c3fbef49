//! Router-level integration tests
//!
//! The full middleware chain and handlers over a mock bus transport:
//! telemetry enters through injected bus messages exactly as it would from
//! the broker, and responses are checked against the API contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tower::ServiceExt;

use modax_advisory::advisory_cache_key;
use modax_bus::testing::MockTransport;
use modax_bus::{topics, BusTransport};
use modax_core::registry::unix_now;
use modax_core::Config;
use modax_gateway::{ingress, server, AppState};

async fn setup(pairs: &[(&str, &str)]) -> (Router, AppState, Arc<MockTransport>) {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let config = Arc::new(Config::from_lookup(|key| map.get(key).cloned()).unwrap());

    let bus = Arc::new(MockTransport::new());
    bus.connect().await.unwrap();

    let metrics = PrometheusBuilder::new().build_recorder().handle();
    let state = AppState::new(config, bus.clone() as Arc<dyn BusTransport>, metrics).unwrap();
    ingress::wire(&state).await.unwrap();

    (server::build_router(state.clone()), state, bus)
}

fn sample_json(device: &str, ts: f64) -> Vec<u8> {
    json!({
        "device_id": device,
        "timestamp": ts,
        "motor_currents": [4.5, 4.3],
        "vibration": {"x": 1.2, "y": 1.1, "z": 1.3, "magnitude": 2.1},
        "temperatures": [45.5, 46.2],
    })
    .to_string()
    .into_bytes()
}

fn safety_json(device: &str, ts: f64, estop: bool) -> Vec<u8> {
    json!({
        "device_id": device,
        "timestamp": ts,
        "emergency_stop": estop,
        "door_closed": true,
        "overload_detected": false,
        "temperature_ok": true,
    })
    .to_string()
    .into_bytes()
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    request(router, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn get_with_key(router: &Router, uri: &str, key: &str) -> (StatusCode, Value) {
    request(
        router,
        Request::get(uri)
            .header("x-api-key", key)
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

async fn post_json(router: &Router, uri: &str, body: Value, key: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    request(router, builder.body(Body::from(body.to_string())).unwrap()).await
}

async fn request(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn assert_envelope(body: &Value, kind: &str, status: u16) {
    assert_eq!(body["error"], kind, "envelope: {body}");
    assert_eq!(body["status_code"], status);
    assert!(body["message"].is_string());
    assert!(body["timestamp"].is_string());
    assert!(body["details"]["path"].is_string());
    assert!(body["details"]["method"].is_string());
}

// ============================================================================
// Liveness / readiness
// ============================================================================

#[tokio::test]
async fn health_needs_nothing() {
    let (router, _, _) = setup(&[]).await;
    let (status, body) = get(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn ready_reflects_bus_connection() {
    let (router, _, _) = setup(&[]).await;
    let (status, body) = get(&router, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn ready_fails_without_bus_session() {
    let (router, _, bus) = setup(&[]).await;
    bus.disconnect().await;
    let (status, body) = get(&router, "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_envelope(&body, "TransportError", 503);
}

// ============================================================================
// Status / devices / data
// ============================================================================

#[tokio::test]
async fn status_reports_safe_fleet() {
    let (router, _, bus) = setup(&[]).await;
    let now = unix_now();
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", now));
    bus.inject(topics::SENSOR_SAFETY, &safety_json("D1", now, false));

    let (status, body) = get(&router, "/api/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_safe"], true);
    assert_eq!(body["devices_online"], json!(["D1"]));
    assert_eq!(body["ai_enabled"], true);
    assert!(body["last_update"].is_number());
    assert!(body["ai_last_analysis"].is_null());
}

#[tokio::test]
async fn status_unsafe_without_any_devices() {
    let (router, _, _) = setup(&[]).await;
    let (status, body) = get(&router, "/api/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_safe"], false);
    assert_eq!(body["devices_online"], json!([]));
}

#[tokio::test]
async fn published_sample_is_immediately_readable() {
    let (router, _, bus) = setup(&[]).await;
    let now = unix_now();
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", now));

    let (status, body) = get(&router, "/api/v1/devices/D1/data").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["online"], true);
    assert_eq!(body["latest_sample"]["motor_currents"], json!([4.5, 4.3]));
    assert_eq!(body["aggregate"]["sample_count"], 1);
    assert_eq!(body["aggregate"]["current_mean"][0], 4.5);
}

#[tokio::test]
async fn aggregate_matches_over_fifty_samples() {
    let (router, _, bus) = setup(&[]).await;
    let now = unix_now();
    for i in 0..50 {
        bus.inject(topics::SENSOR_DATA, &sample_json("D1", now + i as f64 * 0.1));
    }

    let (status, body) = get(&router, "/api/v1/devices/D1/data").await;
    assert_eq!(status, StatusCode::OK);
    let agg = &body["aggregate"];
    assert_eq!(agg["sample_count"], 50);
    assert!((agg["current_mean"][0].as_f64().unwrap() - 4.5).abs() < 1e-9);
    assert!((agg["current_mean"][1].as_f64().unwrap() - 4.3).abs() < 1e-9);
    assert!((agg["vibration_mean"]["magnitude"].as_f64().unwrap() - 2.1).abs() < 1e-9);
    assert!((agg["temperature_mean"][0].as_f64().unwrap() - 45.5).abs() < 1e-9);
}

#[tokio::test]
async fn unknown_device_is_enveloped_404() {
    let (router, _, _) = setup(&[]).await;
    let (status, body) = get(&router, "/api/v1/devices/ghost/data").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_envelope(&body, "NotFound", 404);
    assert_eq!(body["details"]["path"], "/api/v1/devices/ghost/data");
    assert_eq!(body["details"]["method"], "GET");
}

#[tokio::test]
async fn unknown_route_is_enveloped_404() {
    let (router, _, _) = setup(&[]).await;
    let (status, body) = get(&router, "/api/v2/nothing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_envelope(&body, "NotFound", 404);
}

#[tokio::test]
async fn device_list_includes_liveness_and_safety() {
    let (router, _, bus) = setup(&[]).await;
    let now = unix_now();
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", now));
    bus.inject(topics::SENSOR_SAFETY, &safety_json("D1", now, false));

    let (status, body) = get(&router, "/api/v1/devices").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["devices"][0]["device_id"], "D1");
    assert_eq!(body["devices"][0]["online"], true);
    assert_eq!(body["devices"][0]["is_safe"], true);
}

// ============================================================================
// History / export
// ============================================================================

#[tokio::test]
async fn history_limit_is_bounded() {
    let (router, _, bus) = setup(&[]).await;
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", unix_now()));

    let (status, body) = get(&router, "/api/v1/devices/D1/history?limit=1001").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_envelope(&body, "ValidationError", 422);
}

#[tokio::test]
async fn history_returns_recorded_aggregates() {
    let (router, state, bus) = setup(&[]).await;
    let now = unix_now();
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", now));
    state.registry.record_aggregates_at(now);

    let (status, body) = get(&router, "/api/v1/devices/D1/history?limit=10").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["aggregates"][0]["sample_count"], 1);
}

#[tokio::test]
async fn csv_export_has_contract_header() {
    let (router, state, bus) = setup(&[]).await;
    let now = unix_now();
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", now));
    state.registry.record_aggregates_at(now);

    let response = router
        .clone()
        .oneshot(
            Request::get("/api/v1/export/D1/csv?hours=24")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/csv"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next().unwrap(),
        "timestamp,device_id,current_a,current_b,current_c,vibration,temperature,rpm,power_kw"
    );
    assert!(lines.next().unwrap().contains("D1"));
}

#[tokio::test]
async fn export_validates_hours_and_format() {
    let (router, state, bus) = setup(&[]).await;
    let now = unix_now();
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", now));
    state.registry.record_aggregates_at(now);

    let (status, body) = get(&router, "/api/v1/export/D1/csv?hours=200").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_envelope(&body, "ValidationError", 422);

    let (status, _) = get(&router, "/api/v1/export/D1/xml?hours=1").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = get(&router, "/api/v1/export/ghost/csv?hours=1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Advisory cache
// ============================================================================

#[tokio::test]
async fn advisory_result_round_trips_through_cache() {
    let (router, state, bus) = setup(&[]).await;
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", unix_now()));

    // Never analyzed: 404.
    let (status, _) = get(&router, "/api/v1/devices/D1/ai-analysis").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let result = json!({
        "device_id": "D1",
        "timestamp_ms": 1_734_567_890_000i64,
        "anomaly_detected": false,
        "anomaly_score": 0.10,
        "anomaly_description": "",
        "predicted_wear_level": 0.15,
        "estimated_remaining_hours": 8500,
        "recommendations": ["ok"],
        "confidence": 0.8,
    });
    state.cache.put(
        advisory_cache_key("D1"),
        result.clone(),
        Duration::from_secs(60),
    );

    let (status, body) = get(&router, "/api/v1/devices/D1/ai-analysis").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, result);

    // Invalidation brings back 404 until the next advisory cycle.
    state.cache.invalidate_device("D1");
    let (status, _) = get(&router, "/api/v1/devices/D1/ai-analysis").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Commands & safety gate
// ============================================================================

#[tokio::test]
async fn command_dispatches_when_safe_then_estop_blocks() {
    let (router, _, bus) = setup(&[]).await;
    let now = unix_now();
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", now));
    bus.inject(topics::SENSOR_SAFETY, &safety_json("D1", now, false));

    let (status, body) = post_json(
        &router,
        "/api/v1/control/command",
        json!({"device_id": "D1", "command_type": "start", "parameters": {"speed": "100"}}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "dispatched");
    assert!(body["request_id"].is_string());
    assert_eq!(bus.published_on("modax/control/commands").len(), 1);

    // Device reports an emergency stop: next command must be refused and
    // nothing published.
    bus.inject(topics::SENSOR_SAFETY, &safety_json("D1", now + 1.0, true));
    let (status, body) = post_json(
        &router,
        "/api/v1/control/command",
        json!({"device_id": "D1", "command_type": "start"}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_envelope(&body, "SafetyRefused", 409);
    assert_eq!(bus.published_on("modax/control/commands").len(), 1);
}

#[tokio::test]
async fn malformed_command_body_is_422() {
    let (router, _, bus) = setup(&[]).await;
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", unix_now()));

    let (status, body) = post_json(
        &router,
        "/api/v1/control/command",
        json!({"device_id": "D1"}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_envelope(&body, "ValidationError", 422);
}

#[tokio::test]
async fn estop_endpoint_round_trips_the_gate() {
    let (router, _, bus) = setup(&[]).await;
    let now = unix_now();
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", now));
    bus.inject(topics::SENSOR_SAFETY, &safety_json("D1", now, false));

    let (status, body) =
        post_json(&router, "/api/v1/cnc/emergency-stop", json!({"active": true}), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["estop_active"], true);
    assert_eq!(body["system_safe"], false);

    let (status, body) =
        post_json(&router, "/api/v1/cnc/emergency-stop", json!({"active": false}), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["system_safe"], true);
}

// ============================================================================
// Auth
// ============================================================================

const HMI_KEY: &str = "hmi-key-0123456789abcdef0123456789ab";
const MON_KEY: &str = "mon-key-0123456789abcdef0123456789ab";
const ADMIN_KEY: &str = "adm-key-0123456789abcdef0123456789ab";

fn auth_env() -> Vec<(&'static str, &'static str)> {
    vec![
        ("API_KEY_ENABLED", "true"),
        ("HMI_API_KEY", HMI_KEY),
        ("MONITORING_API_KEY", MON_KEY),
        ("ADMIN_API_KEY", ADMIN_KEY),
    ]
}

#[tokio::test]
async fn missing_key_is_401() {
    let (router, _, _) = setup(&auth_env()).await;
    let (status, body) = get(&router, "/api/v1/status").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_envelope(&body, "AuthError", 401);
}

#[tokio::test]
async fn wrong_key_is_401_and_health_stays_open() {
    let (router, _, _) = setup(&auth_env()).await;
    let (status, _) = get_with_key(&router, "/api/v1/status", "nope").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = get(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn monitoring_key_reads_but_cannot_control() {
    let (router, _, bus) = setup(&auth_env()).await;
    let now = unix_now();
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", now));
    bus.inject(topics::SENSOR_SAFETY, &safety_json("D1", now, false));

    let (status, _) = get_with_key(&router, "/api/v1/status", MON_KEY).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_json(
        &router,
        "/api/v1/control/command",
        json!({"device_id": "D1", "command_type": "start"}),
        Some(MON_KEY),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_envelope(&body, "PermissionError", 403);
}

#[tokio::test]
async fn hmi_key_controls() {
    let (router, _, bus) = setup(&auth_env()).await;
    let now = unix_now();
    bus.inject(topics::SENSOR_DATA, &sample_json("D1", now));
    bus.inject(topics::SENSOR_SAFETY, &safety_json("D1", now, false));

    let (status, _) = post_json(
        &router,
        "/api/v1/control/command",
        json!({"device_id": "D1", "command_type": "stop"}),
        Some(HMI_KEY),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn fourth_call_in_window_is_429_with_retry_after() {
    let (router, _, _) = setup(&[("RATE_LIMIT_DEFAULT", "3/minute")]).await;

    for _ in 0..3 {
        let (status, _) = get(&router, "/api/v1/status").await;
        assert_eq!(status, StatusCode::OK);
    }

    let response = router
        .clone()
        .oneshot(Request::get("/api/v1/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse::<u64>()
        .unwrap();
    assert!(retry_after >= 1);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_envelope(&body, "RateLimited", 429);
}

#[tokio::test]
async fn health_is_exempt_from_rate_limits() {
    let (router, _, _) = setup(&[("RATE_LIMIT_DEFAULT", "1/minute")]).await;
    for _ in 0..5 {
        let (status, _) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }
}

// ============================================================================
// Cache stats / metrics
// ============================================================================

#[tokio::test]
async fn cache_stats_expose_exact_hit_rate() {
    let (router, state, _) = setup(&[]).await;
    state
        .cache
        .put("k", json!(1), Duration::from_secs(60));
    state.cache.get("k");
    state.cache.get("missing");

    let (status, body) = get(&router, "/api/v1/cache/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hits"], 1);
    // The stats read itself does not count as a lookup.
    assert!((body["hit_rate"].as_f64().unwrap() - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn metrics_render_as_text() {
    let (router, _, _) = setup(&[]).await;
    let response = router
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
}

#[tokio::test]
async fn request_id_echoed_on_responses() {
    let (router, _, _) = setup(&[]).await;
    let response = router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}
