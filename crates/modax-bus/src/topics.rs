//! Default topic catalog
//!
//! All control-layer traffic lives under the `modax/` namespace.

use crate::transport::QosLevel;

/// High-frequency sensor samples (JSON `SensorSample`).
pub const SENSOR_DATA: &str = "modax/sensor/data";
pub const SENSOR_DATA_QOS: QosLevel = QosLevel::AtMostOnce;

/// Safety status stream (JSON `SafetyStatus`).
pub const SENSOR_SAFETY: &str = "modax/sensor/safety";
pub const SENSOR_SAFETY_QOS: QosLevel = QosLevel::AtLeastOnce;

/// Advisory result echoes (JSON `AdvisoryResult`).
pub const AI_ANALYSIS: &str = "modax/ai/analysis";
pub const AI_ANALYSIS_QOS: QosLevel = QosLevel::AtLeastOnce;

/// Outbound control commands, device-scoped below this prefix.
pub const CONTROL_COMMANDS: &str = "modax/control/commands";
pub const CONTROL_COMMANDS_QOS: QosLevel = QosLevel::AtLeastOnce;

/// Retained online/offline announcement for the control layer itself.
pub const NODE_STATUS: &str = "modax/status/control-layer";

/// Device-scoped command topic.
pub fn command_topic(device_id: &str) -> String {
    format!("{CONTROL_COMMANDS}/{device_id}")
}

/// MQTT topic filter match (`+` single level, `#` multi level).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
