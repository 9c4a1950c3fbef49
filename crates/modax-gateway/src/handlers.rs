//! REST handlers
//!
//! Thin layers over registry, cache, dispatcher, and safety gate. Every
//! failure path returns an `ApiError` that the envelope middleware turns
//! into the standard JSON body.

use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Extension, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use modax_advisory::advisory_cache_key;
use modax_core::audit::{AuditEvent, AuditEventType, AuditSeverity};
use modax_core::model::CommandRequest;
use modax_core::registry::unix_now;

use crate::auth::{AuthContext, Permission};
use crate::error::ApiError;
use crate::export::{self, MAX_EXPORT_HOURS};
use crate::middleware::RequestId;
use crate::state::AppState;

const STATUS_CACHE_TTL: Duration = Duration::from_secs(2);
const DEVICES_CACHE_TTL: Duration = Duration::from_secs(5);

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

/// Process liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "modax-control-layer",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now(),
    }))
}

/// Readiness: bus connected at least once within the readiness window.
pub async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let now = unix_now();
    if !state.ready(now) {
        return Err(ApiError::transport("bus has not connected recently"));
    }
    Ok(Json(json!({
        "ready": true,
        "bus_state": state.bus.state().as_str(),
        "timestamp": chrono::Utc::now(),
    })))
}

/// System snapshot (cached 2 s).
pub async fn system_status(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    state.require_permission(&ctx, Permission::Read)?;
    if let Some(cached) = state.cache.get("status") {
        return Ok(Json(cached));
    }
    let payload = state.status_payload(unix_now());
    state.cache.put("status", payload.clone(), STATUS_CACHE_TTL);
    Ok(Json(payload))
}

/// Device list (cached 5 s).
pub async fn list_devices(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    state.require_permission(&ctx, Permission::Read)?;
    if let Some(cached) = state.cache.get("devices") {
        return Ok(Json(cached));
    }

    let now = unix_now();
    let devices: Vec<Value> = state
        .registry
        .snapshots_at(now)
        .into_iter()
        .map(|snap| {
            json!({
                "device_id": snap.device_id,
                "online": snap.online,
                "last_seen_at": snap.last_seen_at,
                "sample_count": snap.sample_count,
                "is_safe": snap.safety.as_ref().map(|s| s.is_safe()),
            })
        })
        .collect();
    let payload = json!({
        "devices": devices,
        "count": devices.len(),
        "timestamp": chrono::Utc::now(),
    });
    state.cache.put("devices", payload.clone(), DEVICES_CACHE_TTL);
    Ok(Json(payload))
}

/// Latest sample plus the current window aggregate.
pub async fn device_data(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.require_permission(&ctx, Permission::Read)?;
    let snap = state
        .registry
        .snapshot_device_at(&device_id, unix_now())
        .ok_or_else(|| ApiError::not_found(format!("unknown device: {device_id}")))?;
    let aggregate = state.registry.aggregate(&device_id);

    Ok(Json(json!({
        "device_id": snap.device_id,
        "online": snap.online,
        "last_seen_at": snap.last_seen_at,
        "latest_sample": snap.latest_sample,
        "aggregate": aggregate,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

/// Last N recorded aggregates, oldest first.
pub async fn device_history(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(device_id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    state.require_permission(&ctx, Permission::Read)?;
    let Query(query) = query.map_err(|e| ApiError::validation(e.to_string()))?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(ApiError::validation(format!(
            "limit must be in [1, {MAX_HISTORY_LIMIT}]"
        )));
    }

    let aggregates = state
        .registry
        .history(&device_id, limit)
        .ok_or_else(|| ApiError::not_found(format!("unknown device: {device_id}")))?;
    Ok(Json(json!({
        "device_id": device_id,
        "count": aggregates.len(),
        "aggregates": aggregates,
    })))
}

/// Latest safety snapshot.
pub async fn device_safety(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.require_permission(&ctx, Permission::Read)?;
    let snap = state
        .registry
        .snapshot_device_at(&device_id, unix_now())
        .ok_or_else(|| ApiError::not_found(format!("unknown device: {device_id}")))?;
    let safety = snap
        .safety
        .ok_or_else(|| ApiError::not_found(format!("no safety report from {device_id} yet")))?;
    let is_safe = safety.is_safe();

    Ok(Json(json!({
        "device_id": device_id,
        "safety": safety,
        "is_safe": is_safe,
    })))
}

/// Cached advisory result; 404 until the first successful advisory cycle.
pub async fn device_ai_analysis(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.require_permission(&ctx, Permission::Read)?;
    if !state.registry.contains(&device_id) {
        return Err(ApiError::not_found(format!("unknown device: {device_id}")));
    }
    state
        .cache
        .get(&advisory_cache_key(&device_id))
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no advisory result cached for {device_id}")))
}

/// Dispatch a control command through the safety gate.
pub async fn dispatch_command(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    state.require_permission(&ctx, Permission::Control)?;
    let Json(command) = payload.map_err(|e| ApiError::validation(e.body_text()))?;

    let receipt = state
        .dispatcher
        .dispatch(command.clone(), &ctx.actor, &request_id)
        .await?;

    Ok(Json(json!({
        "status": "dispatched",
        "request_id": receipt.request_id,
        "topic": receipt.topic,
        "device_id": command.device_id,
        "command_type": command.command_type,
        "timestamp": chrono::Utc::now(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct EstopRequest {
    active: bool,
}

/// Engage or release the global emergency stop.
pub async fn emergency_stop(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    payload: Result<Json<EstopRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    state.require_permission(&ctx, Permission::Control)?;
    let Json(req) = payload.map_err(|e| ApiError::validation(e.body_text()))?;

    state.estop.set(req.active);
    state.cache.invalidate("status");
    state.audit.emit(
        AuditEvent::new(
            AuditEventType::ConfigChange,
            AuditSeverity::Warning,
            ctx.actor.clone(),
            if req.active {
                "global emergency stop engaged"
            } else {
                "global emergency stop released"
            },
        )
        .with("estop_active", req.active),
    );

    let now = unix_now();
    state.publish_system_status(now);
    Ok(Json(json!({
        "estop_active": req.active,
        "system_safe": state.system_safe(now),
        "timestamp": chrono::Utc::now(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    hours: Option<f64>,
}

/// Export recorded aggregates as CSV or JSON.
pub async fn export_device(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path((device_id, format)): Path<(String, String)>,
    query: Result<Query<ExportQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    state.require_permission(&ctx, Permission::Read)?;
    let Query(query) = query.map_err(|e| ApiError::validation(e.to_string()))?;
    let hours = query.hours.unwrap_or(24.0);
    if !(hours > 0.0 && hours <= MAX_EXPORT_HOURS) {
        return Err(ApiError::validation(format!(
            "hours must be in (0, {MAX_EXPORT_HOURS}]"
        )));
    }

    let since = unix_now() - hours * 3600.0;
    let aggregates = state
        .registry
        .history_since(&device_id, since)
        .ok_or_else(|| ApiError::not_found(format!("unknown device: {device_id}")))?;
    let rows = export::rows(&device_id, &aggregates);

    match format.as_str() {
        "csv" => {
            let body = export::to_csv(&rows);
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
                body,
            )
                .into_response())
        }
        "json" => Ok(Json(json!({
            "device_id": device_id,
            "count": rows.len(),
            "rows": rows,
        }))
        .into_response()),
        other => Err(ApiError::validation(format!(
            "unsupported export format {other:?}, expected csv or json"
        ))),
    }
}

/// Cache statistics.
pub async fn cache_stats(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    state.require_permission(&ctx, Permission::Read)?;
    let stats = state.cache.stats();
    Ok(Json(json!({
        "size": stats.size,
        "hits": stats.hits,
        "misses": stats.misses,
        "hit_rate": stats.hit_rate,
        "timestamp": chrono::Utc::now(),
    })))
}

/// Prometheus exposition.
pub async fn metrics_exposition(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    if !state.config.api.metrics_public {
        state.require_permission(&ctx, Permission::Read)?;
    }
    state.update_gauges(unix_now());
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response())
}
