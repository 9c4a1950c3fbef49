//! Token-bucket rate limiting
//!
//! Three keyed buckets (default, write, export) with the identity decided by
//! the auth middleware: API key if present, remote address otherwise.
//! Exceeding a bucket yields 429 with `Retry-After`.

use std::num::NonZeroU32;

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};

use modax_core::config::{RateLimitConfig, RateQuota};

use crate::auth::RateKey;
use crate::error::ApiError;
use crate::state::AppState;

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Which bucket a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitClass {
    Default,
    Write,
    Export,
    Exempt,
}

pub fn classify(method: &Method, path: &str) -> LimitClass {
    if path == "/health" || path == "/ready" || path == "/metrics" || path.starts_with("/ws") {
        return LimitClass::Exempt;
    }
    if path.starts_with("/api/v1/export/") {
        return LimitClass::Export;
    }
    if method == Method::POST
        && (path == "/api/v1/control/command" || path == "/api/v1/cnc/emergency-stop")
    {
        return LimitClass::Write;
    }
    LimitClass::Default
}

fn build_limiter(quota: RateQuota) -> KeyedLimiter {
    let count = NonZeroU32::new(quota.count).expect("validated non-zero at config load");
    let q = Quota::with_period(quota.period() / quota.count)
        .expect("validated non-zero at config load")
        .allow_burst(count);
    RateLimiter::keyed(q)
}

pub struct ApiRateLimiter {
    enabled: bool,
    clock: DefaultClock,
    default: KeyedLimiter,
    write: KeyedLimiter,
    export: KeyedLimiter,
}

impl ApiRateLimiter {
    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            clock: DefaultClock::default(),
            default: build_limiter(cfg.default),
            write: build_limiter(cfg.write),
            export: build_limiter(cfg.export),
        }
    }

    /// Check one request against its bucket. `Err` carries the suggested
    /// `Retry-After` in seconds.
    pub fn check(&self, class: LimitClass, key: &str) -> Result<(), u64> {
        if !self.enabled {
            return Ok(());
        }
        let limiter = match class {
            LimitClass::Exempt => return Ok(()),
            LimitClass::Default => &self.default,
            LimitClass::Write => &self.write,
            LimitClass::Export => &self.export,
        };
        limiter.check_key(&key.to_string()).map_err(|not_until| {
            not_until
                .wait_time_from(self.clock.now())
                .as_secs()
                .max(1)
        })
    }
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let class = classify(req.method(), req.uri().path());
    let key = req
        .extensions()
        .get::<RateKey>()
        .map(|k| k.0.clone())
        .unwrap_or_else(|| "unknown".to_string());

    match state.limiter.check(class, &key) {
        Ok(()) => next.run(req).await,
        Err(retry_after) => ApiError::rate_limited(retry_after).into_response(),
    }
}
