//! Advisory service HTTP client
//!
//! One POST per eligible device per tick. The deadline is attached here, at
//! the call site; the orchestrator never holds a registry lock across it.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use modax_core::model::{AdvisoryResult, Aggregate, AxisStats};

/// Failure classification per the error taxonomy. All variants are
/// non-fatal: counted, logged, and the prior cached result is kept.
#[derive(Error, Debug)]
pub enum AdvisoryError {
    #[error("advisory request timed out")]
    Timeout,

    #[error("advisory transport error: {0}")]
    Transport(String),

    #[error("advisory service returned HTTP {status}")]
    Http { status: u16 },

    #[error("advisory response decode failed: {0}")]
    Decode(String),
}

impl AdvisoryError {
    /// Label used for `advisory_requests_total{result=...}`.
    pub fn class(&self) -> &'static str {
        match self {
            AdvisoryError::Timeout => "timeout",
            AdvisoryError::Transport(_) => "transport_error",
            AdvisoryError::Http { status } if *status >= 500 => "5xx",
            AdvisoryError::Http { .. } => "4xx_validation",
            AdvisoryError::Decode(_) => "decode_error",
        }
    }
}

/// Request body for the advisory POST (wire contract, do not reorder
/// semantics: channels are positional).
#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryRequest {
    pub device_id: String,
    pub time_window_start: f64,
    pub time_window_end: f64,
    pub current_mean: Vec<f64>,
    pub current_std: Vec<f64>,
    pub current_max: Vec<f64>,
    pub vibration_mean: AxisStats,
    pub vibration_std: AxisStats,
    pub vibration_max: AxisStats,
    pub temperature_mean: Vec<f64>,
    pub temperature_max: Vec<f64>,
    pub sample_count: usize,
}

impl AdvisoryRequest {
    pub fn from_aggregate(device_id: &str, agg: &Aggregate) -> Self {
        Self {
            device_id: device_id.to_string(),
            time_window_start: agg.time_window_start,
            time_window_end: agg.time_window_end,
            current_mean: agg.current_mean.clone(),
            current_std: agg.current_std.clone(),
            current_max: agg.current_max.clone(),
            vibration_mean: agg.vibration_mean,
            vibration_std: agg.vibration_std,
            vibration_max: agg.vibration_max,
            temperature_mean: agg.temperature_mean.clone(),
            temperature_max: agg.temperature_max.clone(),
            sample_count: agg.sample_count,
        }
    }
}

pub struct AdvisoryClient {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl AdvisoryClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }

    /// POST one aggregate and decode the result. The whole call (connect,
    /// send, read, decode) runs under a single deadline; timing out cancels
    /// the request without leaking the connection.
    pub async fn analyze(&self, request: &AdvisoryRequest) -> Result<AdvisoryResult, AdvisoryError> {
        let call = async {
            let response = self
                .http
                .post(&self.url)
                .json(request)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        AdvisoryError::Timeout
                    } else {
                        AdvisoryError::Transport(e.to_string())
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(AdvisoryError::Http {
                    status: status.as_u16(),
                });
            }

            response
                .json::<AdvisoryResult>()
                .await
                .map_err(|e| AdvisoryError::Decode(e.to_string()))
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AdvisoryError::Timeout),
        }
    }
}
