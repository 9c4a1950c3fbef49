//! API-key authentication
//!
//! `X-API-Key` resolves to a fixed permission set decided at config load.
//! WebSocket handshakes may carry the key as an `api_key` query parameter
//! since browsers cannot set headers on WS upgrades.

use std::collections::HashMap;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;

use modax_core::audit::{AuditEvent, AuditEventType, AuditSeverity};
use modax_core::config::AuthConfig;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
    Control,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Control => "control",
            Permission::Admin => "admin",
        }
    }
}

/// Permission set attached to a resolved key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub control: bool,
    pub admin: bool,
}

impl Permissions {
    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
            control: true,
            admin: true,
        }
    }

    pub fn allows(&self, permission: Permission) -> bool {
        match permission {
            Permission::Read => self.read,
            Permission::Write => self.write,
            Permission::Control => self.control,
            Permission::Admin => self.admin,
        }
    }
}

/// Authenticated request context, inserted by the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub actor: String,
    pub permissions: Permissions,
}

/// Key used by the rate limiter: the API key when present, else the remote
/// address.
#[derive(Debug, Clone)]
pub struct RateKey(pub String);

/// Fixed key→permission mapping, built once at startup.
pub struct ApiKeyring {
    enabled: bool,
    keys: HashMap<String, (&'static str, Permissions)>,
}

impl ApiKeyring {
    pub fn from_config(cfg: &AuthConfig) -> Self {
        let mut keys = HashMap::new();
        if let Some(key) = &cfg.hmi_key {
            keys.insert(
                key.clone(),
                (
                    "hmi",
                    Permissions {
                        read: true,
                        control: true,
                        ..Permissions::default()
                    },
                ),
            );
        }
        if let Some(key) = &cfg.monitoring_key {
            keys.insert(
                key.clone(),
                (
                    "monitoring",
                    Permissions {
                        read: true,
                        ..Permissions::default()
                    },
                ),
            );
        }
        if let Some(key) = &cfg.admin_key {
            keys.insert(key.clone(), ("admin", Permissions::all()));
        }
        Self {
            enabled: cfg.enabled,
            keys,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn resolve(&self, key: &str) -> Option<AuthContext> {
        self.keys.get(key).map(|(role, permissions)| AuthContext {
            actor: role.to_string(),
            permissions: *permissions,
        })
    }
}

/// Endpoints that never require a key.
fn is_exempt(path: &str, metrics_public: bool) -> bool {
    match path {
        "/health" | "/ready" => true,
        "/metrics" => metrics_public,
        _ => false,
    }
}

fn extract_key(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get("x-api-key") {
        return value.to_str().ok().map(str::to_string);
    }
    // Query-parameter fallback for WebSocket handshakes only.
    if req.uri().path().starts_with("/ws") {
        if let Some(query) = req.uri().query() {
            for pair in query.split('&') {
                if let Some(v) = pair.strip_prefix("api_key=") {
                    return Some(v.to_string());
                }
            }
        }
    }
    None
}

fn remote_addr(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|c| c.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let key = extract_key(&req);

    // Rate-limit identity: key when present, remote address otherwise.
    let rate_key = key.clone().unwrap_or_else(|| remote_addr(&req));
    req.extensions_mut().insert(RateKey(rate_key));

    if !state.keyring.enabled() {
        req.extensions_mut().insert(AuthContext {
            actor: "anonymous".into(),
            permissions: Permissions::all(),
        });
        return next.run(req).await;
    }

    if is_exempt(&path, state.config.api.metrics_public) {
        req.extensions_mut().insert(AuthContext {
            actor: "anonymous".into(),
            permissions: Permissions::default(),
        });
        return next.run(req).await;
    }

    match key.and_then(|k| state.keyring.resolve(&k)) {
        Some(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        None => {
            state.audit.emit(
                AuditEvent::new(
                    AuditEventType::Authentication,
                    AuditSeverity::Warning,
                    remote_addr(&req),
                    "rejected request with missing or invalid API key",
                )
                .with("path", path),
            );
            ApiError::auth("missing or invalid API key").into_response()
        }
    }
}
