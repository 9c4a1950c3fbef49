//! Wire and domain types shared across the control layer
//!
//! Everything here mirrors the JSON payloads exchanged with field devices,
//! the advisory service, and API clients.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ValidationError;

/// Upper bound on motor current magnitude considered plausible (amperes).
pub const MAX_PLAUSIBLE_CURRENT_A: f64 = 1_000.0;

/// Plausible temperature range (°C). Lower bound is absolute zero.
pub const MIN_PLAUSIBLE_TEMP_C: f64 = -273.15;
pub const MAX_PLAUSIBLE_TEMP_C: f64 = 2_000.0;

/// Upper bound on vibration magnitude considered plausible (m/s²).
pub const MAX_PLAUSIBLE_VIBRATION: f64 = 10_000.0;

/// Maximum number of channels a device may declare per sensor family.
pub const MAX_CHANNELS: usize = 64;

/// Tri-axial vibration reading
///
/// `magnitude` is optional on the wire: some firmware revisions compute it on
/// the device, others leave it to the middleware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vibration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnitude: Option<f64>,
}

impl Vibration {
    /// Magnitude as reported by the device, or derived from the axes.
    /// The device-supplied value wins when present.
    pub fn resolved_magnitude(&self) -> f64 {
        self.magnitude
            .unwrap_or_else(|| (self.x * self.x + self.y * self.y + self.z * self.z).sqrt())
    }
}

/// One instantaneous reading published on `modax/sensor/data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub device_id: String,
    /// Unix seconds, fractional
    pub timestamp: f64,
    pub motor_currents: Vec<f64>,
    pub vibration: Vibration,
    pub temperatures: Vec<f64>,
}

impl SensorSample {
    /// Validate that every numeric field is finite and within plausible
    /// physical ranges. Rejected samples are counted, never inserted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.device_id.is_empty() {
            return Err(ValidationError::Malformed("empty device_id".into()));
        }
        if !self.timestamp.is_finite() || self.timestamp <= 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "timestamp",
                value: self.timestamp,
            });
        }
        if self.motor_currents.len() > MAX_CHANNELS || self.temperatures.len() > MAX_CHANNELS {
            return Err(ValidationError::Malformed("too many channels".into()));
        }
        for (i, c) in self.motor_currents.iter().enumerate() {
            if !c.is_finite() || c.abs() > MAX_PLAUSIBLE_CURRENT_A {
                return Err(ValidationError::ChannelOutOfRange {
                    field: "motor_currents",
                    index: i,
                    value: *c,
                });
            }
        }
        for (i, t) in self.temperatures.iter().enumerate() {
            if !t.is_finite() || *t < MIN_PLAUSIBLE_TEMP_C || *t > MAX_PLAUSIBLE_TEMP_C {
                return Err(ValidationError::ChannelOutOfRange {
                    field: "temperatures",
                    index: i,
                    value: *t,
                });
            }
        }
        let v = &self.vibration;
        for (name, axis) in [("x", v.x), ("y", v.y), ("z", v.z)] {
            if !axis.is_finite() || axis.abs() > MAX_PLAUSIBLE_VIBRATION {
                return Err(ValidationError::Malformed(format!(
                    "vibration.{name} out of range: {axis}"
                )));
            }
        }
        if let Some(m) = v.magnitude {
            if !m.is_finite() || m < 0.0 || m > MAX_PLAUSIBLE_VIBRATION {
                return Err(ValidationError::Malformed(format!(
                    "vibration.magnitude out of range: {m}"
                )));
            }
        }
        Ok(())
    }
}

/// Latest per-device safety snapshot published on `modax/sensor/safety`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub device_id: String,
    pub timestamp: f64,
    pub emergency_stop: bool,
    pub door_closed: bool,
    pub overload_detected: bool,
    pub temperature_ok: bool,
}

impl SafetyStatus {
    /// Derived predicate: safe iff no estop, door closed, no overload,
    /// temperature in range.
    pub fn is_safe(&self) -> bool {
        !self.emergency_stop && self.door_closed && !self.overload_detected && self.temperature_ok
    }
}

/// Per-axis statistics over the vibration channels of a window
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisStats {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub magnitude: f64,
}

/// Statistical summary of a device's current rolling window
///
/// Invariants: `std >= 0`, `max >= mean` componentwise, `sample_count < 2`
/// implies `std == 0`. Stddev is population stddev.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub time_window_start: f64,
    pub time_window_end: f64,
    pub sample_count: usize,
    pub current_mean: Vec<f64>,
    pub current_std: Vec<f64>,
    pub current_max: Vec<f64>,
    pub temperature_mean: Vec<f64>,
    pub temperature_std: Vec<f64>,
    pub temperature_max: Vec<f64>,
    pub vibration_mean: AxisStats,
    pub vibration_std: AxisStats,
    pub vibration_max: AxisStats,
}

/// Advisory service output, cached per device
///
/// Opaque to the control layer beyond the fields needed for routing and
/// display; the middleware never acts on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryResult {
    pub device_id: String,
    pub timestamp_ms: i64,
    pub anomaly_detected: bool,
    pub anomaly_score: f64,
    pub anomaly_description: String,
    pub predicted_wear_level: f64,
    pub estimated_remaining_hours: u64,
    pub recommendations: Vec<String>,
    pub confidence: f64,
}

/// Inbound control command request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub device_id: String,
    pub command_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Owned, lock-free view of one device's registry state
///
/// Returned by registry reads so API handlers, WS fan-out, and the advisory
/// orchestrator never hold a device lock.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub online: bool,
    pub last_seen_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_analysis_at: Option<f64>,
    pub sample_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_sample: Option<SensorSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety: Option<SafetyStatus>,
}

impl DeviceSnapshot {
    /// Safety predicate for the gate: a device with no safety report yet is
    /// treated as unsafe.
    pub fn is_safe(&self) -> bool {
        self.safety.as_ref().map(SafetyStatus::is_safe).unwrap_or(false)
    }
}
