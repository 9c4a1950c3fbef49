//! Shared gateway state
//!
//! Everything the handlers touch, wired once at startup and shared via
//! `Arc`s. The registry, cache, and estop are the only mutable singletons;
//! the rest is immutable configuration and handles.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};

use modax_bus::{BusTransport, ConnectionState};
use modax_core::audit::{AuditEvent, AuditEventType, AuditSeverity, AuditSink};
use modax_core::cache::TtlCache;
use modax_core::events::{EventKind, PushEvent};
use modax_core::metrics_names;
use modax_core::registry::{DeviceRegistry, RegistryConfig};
use modax_core::safety::{is_system_safe, Estop};
use modax_core::Config;

use crate::auth::{ApiKeyring, AuthContext, Permission};
use crate::dispatch::CommandDispatcher;
use crate::error::ApiError;
use crate::rate_limit::ApiRateLimiter;
use crate::ws::FanoutHub;

/// `/ready` window: bus must have been connected within twice the maximum
/// reconnect delay.
pub const READY_WINDOW_SECS: f64 = 120.0;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<DeviceRegistry>,
    pub cache: Arc<TtlCache>,
    pub estop: Arc<Estop>,
    pub bus: Arc<dyn BusTransport>,
    pub audit: Arc<AuditSink>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub fanout: Arc<FanoutHub>,
    pub keyring: Arc<ApiKeyring>,
    pub limiter: Arc<ApiRateLimiter>,
    pub metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        bus: Arc<dyn BusTransport>,
        metrics: PrometheusHandle,
    ) -> anyhow::Result<Self> {
        let audit = Arc::new(match &config.audit_log_path {
            Some(path) => AuditSink::file(path)?,
            None => AuditSink::stdout(),
        });
        let registry = Arc::new(DeviceRegistry::new(RegistryConfig::from(&config.aggregation)));
        let cache = Arc::new(TtlCache::new("api"));
        let estop = Arc::new(Estop::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&estop),
            Arc::clone(&bus),
            Arc::clone(&audit),
        ));
        let fanout = Arc::new(FanoutHub::new(
            config.ws.max_connections,
            config.ws.session_queue,
            Arc::clone(&audit),
        ));
        let keyring = Arc::new(ApiKeyring::from_config(&config.auth));
        let limiter = Arc::new(ApiRateLimiter::from_config(&config.rate_limit));

        Ok(Self {
            config,
            registry,
            cache,
            estop,
            bus,
            audit,
            dispatcher,
            fanout,
            keyring,
            limiter,
            metrics,
        })
    }

    pub fn system_safe(&self, now: f64) -> bool {
        is_system_safe(&self.registry.online_snapshots_at(now), self.estop.engaged())
    }

    /// `/api/v1/status` payload.
    pub fn status_payload(&self, now: f64) -> Value {
        let online = self.registry.online_snapshots_at(now);
        let is_safe = is_system_safe(&online, self.estop.engaged());
        let ids: Vec<&str> = online.iter().map(|d| d.device_id.as_str()).collect();
        json!({
            "is_safe": is_safe,
            "devices_online": ids,
            "last_update": self.registry.last_update_at(),
            "ai_enabled": self.config.advisory.enabled,
            "ai_last_analysis": self.registry.last_analysis_at(),
        })
    }

    /// Permission check with an `authorization` audit trail on denial.
    pub fn require_permission(
        &self,
        ctx: &AuthContext,
        permission: Permission,
    ) -> Result<(), ApiError> {
        if ctx.permissions.allows(permission) {
            return Ok(());
        }
        self.audit.emit(
            AuditEvent::new(
                AuditEventType::Authorization,
                AuditSeverity::Warning,
                ctx.actor.clone(),
                format!("denied: missing {} permission", permission.as_str()),
            )
            .with("permission", permission.as_str()),
        );
        Err(ApiError::permission(format!(
            "requires {} permission",
            permission.as_str()
        )))
    }

    /// Readiness: configuration validated (always true once running) and a
    /// bus session established within the readiness window.
    pub fn ready(&self, now: f64) -> bool {
        self.bus.state() == ConnectionState::Connected
            || self
                .bus
                .last_connected_at()
                .map(|t| now - t <= READY_WINDOW_SECS)
                .unwrap_or(false)
    }

    /// Refresh the slow-moving gauges.
    pub fn update_gauges(&self, now: f64) {
        let online = self.registry.online_snapshots_at(now);
        metrics::gauge!(metrics_names::DEVICES_ONLINE).set(online.len() as f64);
        let safe = is_system_safe(&online, self.estop.engaged());
        metrics::gauge!(metrics_names::SYSTEM_SAFE).set(if safe { 1.0 } else { 0.0 });
    }

    /// Push a `system_status` event to real-time subscribers.
    pub fn publish_system_status(&self, now: f64) {
        self.registry.events().publish(PushEvent::new(
            EventKind::SystemStatus,
            None,
            now,
            self.status_payload(now),
        ));
    }
}
