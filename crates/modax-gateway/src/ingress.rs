//! Bus ingress wiring
//!
//! Registers the telemetry and safety handlers on the bus transport. The
//! handlers run on the bus driver task: decode, validate, hand off to the
//! registry. No I/O, no lock held across anything that suspends. Decode
//! failures are counted and logged, never fatal.

use std::sync::Arc;

use tracing::{debug, warn};

use modax_bus::transport::MessageHandler;
use modax_bus::{topics, BusError};
use modax_core::audit::{AuditEvent, AuditEventType, AuditSeverity};
use modax_core::metrics_names;
use modax_core::model::{SafetyStatus, SensorSample};

use crate::state::AppState;

fn count_decode_error(topic: &str, err: &serde_json::Error) {
    metrics::counter!(metrics_names::BUS_DECODE_ERRORS_TOTAL, "topic" => topic.to_string())
        .increment(1);
    warn!(topic, "undecodable bus payload: {err}");
}

/// Subscribe the registry to the sensor and safety streams.
pub async fn wire(state: &AppState) -> Result<(), BusError> {
    let registry = Arc::clone(&state.registry);
    let sample_handler: MessageHandler = Arc::new(move |topic, payload| {
        match serde_json::from_slice::<SensorSample>(payload) {
            Ok(sample) => {
                let device_id = sample.device_id.clone();
                if let Err(e) = registry.ingest_sample(sample) {
                    debug!(device = %device_id, "sample rejected: {e}");
                }
            }
            Err(e) => count_decode_error(topic, &e),
        }
    });
    state
        .bus
        .subscribe(topics::SENSOR_DATA, topics::SENSOR_DATA_QOS, sample_handler)
        .await?;

    let registry = Arc::clone(&state.registry);
    let audit = Arc::clone(&state.audit);
    let safety_handler: MessageHandler = Arc::new(move |topic, payload| {
        match serde_json::from_slice::<SafetyStatus>(payload) {
            Ok(status) => {
                let device_id = status.device_id.clone();
                let outcome = registry.ingest_safety(status);
                if let Some(now_safe) = outcome.transitioned_to {
                    let (severity, word) = if now_safe {
                        (AuditSeverity::Info, "safe")
                    } else {
                        (AuditSeverity::Critical, "unsafe")
                    };
                    audit.emit(
                        AuditEvent::new(
                            AuditEventType::SafetyTransition,
                            severity,
                            "field-device",
                            format!("device {device_id} is now {word}"),
                        )
                        .with("device_id", device_id),
                    );
                }
            }
            Err(e) => count_decode_error(topic, &e),
        }
    });
    state
        .bus
        .subscribe(topics::SENSOR_SAFETY, topics::SENSOR_SAFETY_QOS, safety_handler)
        .await?;

    Ok(())
}
