//! Device registry and aggregator
//!
//! Canonical owner of all per-device state: rolling sample windows, latest
//! safety snapshots, liveness timestamps, and aggregate history. Entries are
//! sharded in a concurrent map so mutation is serialized per device without
//! any cross-device lock. Every read hands out an owned snapshot.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::config::AggregationConfig;
use crate::error::ValidationError;
use crate::events::{EventBus, EventKind, PushEvent};
use crate::metrics_names;
use crate::model::{Aggregate, AxisStats, DeviceSnapshot, SafetyStatus, SensorSample};

/// Wall clock as fractional unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Registry tuning, derived from the aggregation config.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub window: Duration,
    pub max_data_points: usize,
    pub online_ttl: Duration,
    pub max_history: usize,
}

impl From<&AggregationConfig> for RegistryConfig {
    fn from(cfg: &AggregationConfig) -> Self {
        Self {
            window: cfg.window,
            max_data_points: cfg.max_data_points,
            online_ttl: cfg.device_online_ttl,
            max_history: cfg.max_history,
        }
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    window: VecDeque<SensorSample>,
    current_channels: Option<usize>,
    temperature_channels: Option<usize>,
    safety: Option<SafetyStatus>,
    last_seen_at: f64,
    last_analysis_at: Option<f64>,
    history: VecDeque<Aggregate>,
}

/// Outcome of a safety ingestion.
///
/// `transitioned_to` is `Some(new_is_safe)` when the flip is audit-worthy:
/// any change of the derived predicate, or a first report that is unsafe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyIngest {
    pub transitioned_to: Option<bool>,
}

/// Per-device state store. Devices are admitted lazily and never deleted.
pub struct DeviceRegistry {
    cfg: RegistryConfig,
    devices: DashMap<String, DeviceState>,
    events: EventBus,
}

impl DeviceRegistry {
    pub fn new(cfg: RegistryConfig) -> Self {
        Self {
            cfg,
            devices: DashMap::new(),
            events: EventBus::default(),
        }
    }

    /// Handle on the registry's push-event channel.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    pub fn ingest_sample(&self, sample: SensorSample) -> Result<(), ValidationError> {
        self.ingest_sample_at(sample, unix_now())
    }

    /// Insert one sample: validate, enforce channel consistency, append,
    /// evict by count then by age, bump liveness, emit a `sensor_data` event
    /// carrying only the new sample.
    pub fn ingest_sample_at(
        &self,
        sample: SensorSample,
        now: f64,
    ) -> Result<(), ValidationError> {
        if let Err(e) = sample.validate() {
            metrics::counter!(metrics_names::SAMPLES_REJECTED_TOTAL).increment(1);
            return Err(e);
        }

        let mut entry = self.devices.entry(sample.device_id.clone()).or_default();

        match entry.current_channels {
            Some(expected) if expected != sample.motor_currents.len() => {
                metrics::counter!(metrics_names::SAMPLES_REJECTED_TOTAL).increment(1);
                return Err(ValidationError::ChannelMismatch {
                    field: "motor_currents",
                    expected,
                    got: sample.motor_currents.len(),
                });
            }
            Some(_) => {}
            None => entry.current_channels = Some(sample.motor_currents.len()),
        }
        match entry.temperature_channels {
            Some(expected) if expected != sample.temperatures.len() => {
                metrics::counter!(metrics_names::SAMPLES_REJECTED_TOTAL).increment(1);
                return Err(ValidationError::ChannelMismatch {
                    field: "temperatures",
                    expected,
                    got: sample.temperatures.len(),
                });
            }
            Some(_) => {}
            None => entry.temperature_channels = Some(sample.temperatures.len()),
        }

        let event_data = serde_json::to_value(&sample).unwrap_or_default();
        let device_id = sample.device_id.clone();
        let sample_ts = sample.timestamp;

        entry.window.push_back(sample);
        while entry.window.len() > self.cfg.max_data_points {
            entry.window.pop_front();
        }
        let horizon = now - self.cfg.window.as_secs_f64();
        while entry
            .window
            .front()
            .map(|s| s.timestamp < horizon)
            .unwrap_or(false)
        {
            entry.window.pop_front();
        }
        entry.last_seen_at = now;
        drop(entry);

        self.events.publish(PushEvent::new(
            EventKind::SensorData,
            Some(device_id),
            sample_ts,
            event_data,
        ));
        Ok(())
    }

    pub fn ingest_safety(&self, status: SafetyStatus) -> SafetyIngest {
        self.ingest_safety_at(status, unix_now())
    }

    /// Overwrite the latest safety snapshot, bump liveness, emit a
    /// `safety_status` event, and report is-safe transitions.
    pub fn ingest_safety_at(&self, status: SafetyStatus, now: f64) -> SafetyIngest {
        let mut entry = self.devices.entry(status.device_id.clone()).or_default();

        let new_safe = status.is_safe();
        let transitioned_to = match entry.safety.as_ref().map(SafetyStatus::is_safe) {
            Some(prev) if prev != new_safe => Some(new_safe),
            Some(_) => None,
            // First report: only an unsafe arrival is audit-worthy.
            None if !new_safe => Some(new_safe),
            None => None,
        };

        let event_data = serde_json::to_value(&status).unwrap_or_default();
        let device_id = status.device_id.clone();
        let ts = status.timestamp;

        entry.safety = Some(status);
        entry.last_seen_at = now;
        drop(entry);

        self.events.publish(PushEvent::new(
            EventKind::SafetyStatus,
            Some(device_id),
            ts,
            event_data,
        ));
        SafetyIngest { transitioned_to }
    }

    pub fn set_last_analysis(&self, device_id: &str, now: f64) {
        if let Some(mut entry) = self.devices.get_mut(device_id) {
            entry.last_analysis_at = Some(now);
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn snapshot_state(&self, device_id: &str, state: &DeviceState, now: f64) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: device_id.to_string(),
            online: now - state.last_seen_at <= self.cfg.online_ttl.as_secs_f64(),
            last_seen_at: state.last_seen_at,
            last_analysis_at: state.last_analysis_at,
            sample_count: state.window.len(),
            latest_sample: state.window.back().cloned(),
            safety: state.safety.clone(),
        }
    }

    pub fn snapshot_device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.snapshot_device_at(device_id, unix_now())
    }

    pub fn snapshot_device_at(&self, device_id: &str, now: f64) -> Option<DeviceSnapshot> {
        self.devices
            .get(device_id)
            .map(|state| self.snapshot_state(device_id, &state, now))
    }

    pub fn snapshots_at(&self, now: f64) -> Vec<DeviceSnapshot> {
        let mut all: Vec<DeviceSnapshot> = self
            .devices
            .iter()
            .map(|entry| self.snapshot_state(entry.key(), &entry, now))
            .collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    pub fn online_snapshots_at(&self, now: f64) -> Vec<DeviceSnapshot> {
        self.snapshots_at(now)
            .into_iter()
            .filter(|s| s.online)
            .collect()
    }

    /// Wall time of the most recent message from any device.
    pub fn last_update_at(&self) -> Option<f64> {
        self.devices
            .iter()
            .map(|e| e.last_seen_at)
            .max_by(|a, b| a.total_cmp(b))
    }

    /// Wall time of the most recent advisory analysis across the fleet.
    pub fn last_analysis_at(&self) -> Option<f64> {
        self.devices
            .iter()
            .filter_map(|e| e.last_analysis_at)
            .max_by(|a, b| a.total_cmp(b))
    }

    // ========================================================================
    // Aggregation
    // ========================================================================

    /// Aggregate over the device's current window. `None` when the device is
    /// unknown or the window is empty.
    pub fn aggregate(&self, device_id: &str) -> Option<Aggregate> {
        self.devices
            .get(device_id)
            .and_then(|state| compute_aggregate(&state.window))
    }

    /// Record the current aggregate of every online device into its history
    /// ring. Called once per orchestrator tick. Returns the number recorded.
    pub fn record_aggregates_at(&self, now: f64) -> usize {
        let ttl = self.cfg.online_ttl.as_secs_f64();
        let mut recorded = 0;
        for mut entry in self.devices.iter_mut() {
            if now - entry.last_seen_at > ttl {
                continue;
            }
            if let Some(agg) = compute_aggregate(&entry.window) {
                entry.history.push_back(agg);
                while entry.history.len() > self.cfg.max_history {
                    entry.history.pop_front();
                }
                recorded += 1;
            }
        }
        recorded
    }

    /// Last `limit` recorded aggregates, oldest first. `None` for an unknown
    /// device.
    pub fn history(&self, device_id: &str, limit: usize) -> Option<Vec<Aggregate>> {
        self.devices.get(device_id).map(|state| {
            let skip = state.history.len().saturating_sub(limit);
            state.history.iter().skip(skip).cloned().collect()
        })
    }

    /// Recorded aggregates whose window ends at or after `since`, oldest
    /// first. `None` for an unknown device.
    pub fn history_since(&self, device_id: &str, since: f64) -> Option<Vec<Aggregate>> {
        self.devices.get(device_id).map(|state| {
            state
                .history
                .iter()
                .filter(|a| a.time_window_end >= since)
                .cloned()
                .collect()
        })
    }
}

/// Mean / population-std / max per channel over the window.
///
/// Channel counts come from the most recent sample; the registry guarantees
/// every sample in the window matches.
fn compute_aggregate(window: &VecDeque<SensorSample>) -> Option<Aggregate> {
    let latest = window.back()?;
    let n = window.len() as f64;
    let ccount = latest.motor_currents.len();
    let tcount = latest.temperatures.len();

    let currents = column_stats(window, ccount, |s, i| s.motor_currents[i]);
    let temps = column_stats(window, tcount, |s, i| s.temperatures[i]);

    let axes: [fn(&SensorSample) -> f64; 4] = [
        |s| s.vibration.x,
        |s| s.vibration.y,
        |s| s.vibration.z,
        |s| s.vibration.resolved_magnitude(),
    ];
    let mut vib = [[0.0f64; 3]; 4];
    for (a, axis) in axes.iter().enumerate() {
        let sum: f64 = window.iter().map(|s| axis(s)).sum();
        let mean = sum / n;
        let var: f64 = window.iter().map(|s| (axis(s) - mean).powi(2)).sum::<f64>() / n;
        let max = window
            .iter()
            .map(|s| axis(s))
            .fold(f64::NEG_INFINITY, f64::max);
        vib[a] = [mean, var.max(0.0).sqrt(), max];
    }

    let (start, end) = window.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |acc, s| {
        (acc.0.min(s.timestamp), acc.1.max(s.timestamp))
    });

    Some(Aggregate {
        time_window_start: start,
        time_window_end: end,
        sample_count: window.len(),
        current_mean: currents.0,
        current_std: currents.1,
        current_max: currents.2,
        temperature_mean: temps.0,
        temperature_std: temps.1,
        temperature_max: temps.2,
        vibration_mean: AxisStats {
            x: vib[0][0],
            y: vib[1][0],
            z: vib[2][0],
            magnitude: vib[3][0],
        },
        vibration_std: AxisStats {
            x: vib[0][1],
            y: vib[1][1],
            z: vib[2][1],
            magnitude: vib[3][1],
        },
        vibration_max: AxisStats {
            x: vib[0][2],
            y: vib[1][2],
            z: vib[2][2],
            magnitude: vib[3][2],
        },
    })
}

fn column_stats(
    window: &VecDeque<SensorSample>,
    channels: usize,
    field: impl Fn(&SensorSample, usize) -> f64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = window.len() as f64;
    let mut mean = vec![0.0; channels];
    let mut std = vec![0.0; channels];
    let mut max = vec![f64::NEG_INFINITY; channels];

    for s in window {
        for i in 0..channels {
            let x = field(s, i);
            mean[i] += x;
            max[i] = max[i].max(x);
        }
    }
    for m in &mut mean {
        *m /= n;
    }
    for s in window {
        for i in 0..channels {
            let d = field(s, i) - mean[i];
            std[i] += d * d;
        }
    }
    for v in &mut std {
        *v = (*v / n).max(0.0).sqrt();
    }
    (mean, std, max)
}
