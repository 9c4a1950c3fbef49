//! Command dispatcher
//!
//! Validates command payloads, consults the safety gate, publishes to the
//! bus at QoS 1, and emits an audit event for every outcome. Advisory
//! availability never enters the picture: commands depend only on registry
//! state and the estop.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use modax_bus::{topics, BusError, BusTransport, QosLevel};
use modax_core::audit::{AuditEvent, AuditEventType, AuditSeverity, AuditSink};
use modax_core::metrics_names;
use modax_core::model::CommandRequest;
use modax_core::registry::{unix_now, DeviceRegistry};
use modax_core::safety::{is_system_safe, Estop};

use crate::error::{ApiError, ErrorKind};

/// Commands a field device accepts.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "start",
    "stop",
    "reset",
    "pause",
    "resume",
    "set_speed",
    "set_feed_rate",
];

pub const MAX_PARAMETERS: usize = 16;
pub const MAX_PARAMETER_KEY_LEN: usize = 64;
pub const MAX_PARAMETER_VALUE_LEN: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReceipt {
    pub request_id: String,
    pub topic: String,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("{0}")]
    Invalid(String),

    #[error("safety gate refused command: {0}")]
    SafetyRefused(String),

    #[error(transparent)]
    Publish(#[from] BusError),
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::UnknownDevice(id) => {
                ApiError::not_found(format!("unknown device: {id}"))
            }
            DispatchError::Invalid(msg) => ApiError::validation(msg),
            DispatchError::SafetyRefused(msg) => ApiError::safety_refused(msg),
            DispatchError::Publish(BusError::Backpressure { capacity }) => ApiError::new(
                ErrorKind::Backpressure,
                format!("publish queue full (capacity {capacity})"),
            ),
            DispatchError::Publish(e) => ApiError::new(ErrorKind::Publish, e.to_string()),
        }
    }
}

pub struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    estop: Arc<Estop>,
    bus: Arc<dyn BusTransport>,
    audit: Arc<AuditSink>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        estop: Arc<Estop>,
        bus: Arc<dyn BusTransport>,
        audit: Arc<AuditSink>,
    ) -> Self {
        Self {
            registry,
            estop,
            bus,
            audit,
        }
    }

    fn validate(&self, cmd: &CommandRequest) -> Result<(), DispatchError> {
        if !self.registry.contains(&cmd.device_id) {
            return Err(DispatchError::UnknownDevice(cmd.device_id.clone()));
        }
        if !ALLOWED_COMMANDS.contains(&cmd.command_type.as_str()) {
            return Err(DispatchError::Invalid(format!(
                "unsupported command_type: {:?}",
                cmd.command_type
            )));
        }
        if cmd.parameters.len() > MAX_PARAMETERS {
            return Err(DispatchError::Invalid(format!(
                "too many parameters ({} > {MAX_PARAMETERS})",
                cmd.parameters.len()
            )));
        }
        for (key, value) in &cmd.parameters {
            if key.len() > MAX_PARAMETER_KEY_LEN {
                return Err(DispatchError::Invalid(format!(
                    "parameter key too long: {key:.32}..."
                )));
            }
            if value.len() > MAX_PARAMETER_VALUE_LEN {
                return Err(DispatchError::Invalid(format!(
                    "parameter value too long for key {key:?}"
                )));
            }
        }
        Ok(())
    }

    fn audit_event(
        &self,
        event_type: AuditEventType,
        severity: AuditSeverity,
        actor: &str,
        action: String,
        cmd: &CommandRequest,
        request_id: &str,
    ) {
        self.audit.emit(
            AuditEvent::new(event_type, severity, actor, action)
                .with("device_id", cmd.device_id.clone())
                .with("command_type", cmd.command_type.clone())
                .with("request_id", request_id),
        );
    }

    /// Validate → safety gate → publish → audit.
    pub async fn dispatch(
        &self,
        cmd: CommandRequest,
        actor: &str,
        request_id: &str,
    ) -> Result<DispatchReceipt, DispatchError> {
        self.validate(&cmd)?;

        let now = unix_now();
        let online = self.registry.online_snapshots_at(now);
        let estop_engaged = self.estop.engaged();
        if !is_system_safe(&online, estop_engaged) {
            let reason = if estop_engaged {
                "global emergency stop engaged"
            } else if online.is_empty() {
                "no online devices"
            } else {
                "one or more online devices report unsafe state"
            };
            metrics::counter!(metrics_names::COMMANDS_DISPATCHED_TOTAL, "result" => "blocked")
                .increment(1);
            self.audit_event(
                AuditEventType::ControlBlocked,
                AuditSeverity::Warning,
                actor,
                format!("blocked {} for {}: {reason}", cmd.command_type, cmd.device_id),
                &cmd,
                request_id,
            );
            return Err(DispatchError::SafetyRefused(reason.to_string()));
        }

        let topic = topics::command_topic(&cmd.device_id);
        let payload = serde_json::to_vec(&cmd)
            .map_err(|e| DispatchError::Invalid(format!("command serialization failed: {e}")))?;

        match self
            .bus
            .publish(&topic, payload, QosLevel::AtLeastOnce)
            .await
        {
            Ok(()) => {
                metrics::counter!(metrics_names::COMMANDS_DISPATCHED_TOTAL, "result" => "ok")
                    .increment(1);
                self.audit_event(
                    AuditEventType::ControlExecuted,
                    AuditSeverity::Info,
                    actor,
                    format!("dispatched {} to {}", cmd.command_type, cmd.device_id),
                    &cmd,
                    request_id,
                );
                Ok(DispatchReceipt {
                    request_id: request_id.to_string(),
                    topic,
                })
            }
            Err(e) => {
                metrics::counter!(metrics_names::COMMANDS_DISPATCHED_TOTAL, "result" => "failed")
                    .increment(1);
                self.audit_event(
                    AuditEventType::ControlFailed,
                    AuditSeverity::Critical,
                    actor,
                    format!(
                        "publish failed for {} to {}: {e}",
                        cmd.command_type, cmd.device_id
                    ),
                    &cmd,
                    request_id,
                );
                Err(DispatchError::Publish(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modax_bus::testing::MockTransport;
    use modax_core::model::{SafetyStatus, SensorSample, Vibration};
    use modax_core::registry::RegistryConfig;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn setup(safe: bool) -> (CommandDispatcher, Arc<MockTransport>, Arc<Estop>) {
        let registry = Arc::new(DeviceRegistry::new(RegistryConfig {
            window: Duration::from_secs(10),
            max_data_points: 100,
            online_ttl: Duration::from_secs(30),
            max_history: 10,
        }));
        let now = unix_now();
        registry
            .ingest_sample_at(
                SensorSample {
                    device_id: "D1".into(),
                    timestamp: now,
                    motor_currents: vec![4.5],
                    vibration: Vibration {
                        x: 0.1,
                        y: 0.1,
                        z: 0.1,
                        magnitude: None,
                    },
                    temperatures: vec![40.0],
                },
                now,
            )
            .unwrap();
        registry.ingest_safety_at(
            SafetyStatus {
                device_id: "D1".into(),
                timestamp: now,
                emergency_stop: !safe,
                door_closed: true,
                overload_detected: false,
                temperature_ok: true,
            },
            now,
        );

        let estop = Arc::new(Estop::new());
        let bus = Arc::new(MockTransport::new());
        let dispatcher = CommandDispatcher::new(
            registry,
            Arc::clone(&estop),
            bus.clone() as Arc<dyn BusTransport>,
            Arc::new(AuditSink::stdout()),
        );
        (dispatcher, bus, estop)
    }

    fn command(device: &str, command_type: &str) -> CommandRequest {
        CommandRequest {
            device_id: device.into(),
            command_type: command_type.into(),
            parameters: BTreeMap::from([("speed".to_string(), "100".to_string())]),
        }
    }

    #[tokio::test]
    async fn safe_system_publishes_device_scoped_command() {
        let (dispatcher, bus, _) = setup(true);
        let receipt = dispatcher
            .dispatch(command("D1", "start"), "hmi", "req-1")
            .await
            .unwrap();
        assert_eq!(receipt.topic, "modax/control/commands/D1");

        let published = bus.published_on("modax/control/commands");
        assert_eq!(published.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(body["command_type"], "start");
        assert_eq!(body["parameters"]["speed"], "100");
        assert_eq!(published[0].qos, QosLevel::AtLeastOnce);
    }

    #[tokio::test]
    async fn unsafe_device_refuses_and_publishes_nothing() {
        let (dispatcher, bus, _) = setup(false);
        let err = dispatcher
            .dispatch(command("D1", "start"), "hmi", "req-2")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::SafetyRefused(_)));
        assert!(bus.published_on("modax/control/commands").is_empty());
    }

    #[tokio::test]
    async fn estop_refuses_even_when_devices_are_safe() {
        let (dispatcher, bus, estop) = setup(true);
        estop.set(true);
        let err = dispatcher
            .dispatch(command("D1", "start"), "hmi", "req-3")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::SafetyRefused(_)));
        assert!(bus.published_on("modax/control/commands").is_empty());
    }

    #[tokio::test]
    async fn unknown_device_rejected_before_the_gate() {
        let (dispatcher, _, _) = setup(true);
        let err = dispatcher
            .dispatch(command("ghost", "start"), "hmi", "req-4")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn unsupported_command_type_rejected() {
        let (dispatcher, _, _) = setup(true);
        let err = dispatcher
            .dispatch(command("D1", "self_destruct"), "hmi", "req-5")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Invalid(_)));
    }

    #[tokio::test]
    async fn oversized_parameters_rejected() {
        let (dispatcher, _, _) = setup(true);
        let mut cmd = command("D1", "start");
        cmd.parameters
            .insert("k".into(), "v".repeat(MAX_PARAMETER_VALUE_LEN + 1));
        let err = dispatcher.dispatch(cmd, "hmi", "req-6").await.unwrap_err();
        assert!(matches!(err, DispatchError::Invalid(_)));
    }

    #[tokio::test]
    async fn publish_failure_maps_to_publish_error() {
        let (dispatcher, bus, _) = setup(true);
        bus.fail_publishes(true);
        let err = dispatcher
            .dispatch(command("D1", "stop"), "hmi", "req-7")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Publish(BusError::Publish(_))));
    }
}
