//! Safety gate
//!
//! A pure predicate over registry snapshots plus a process-wide emergency
//! stop flag. Consulted synchronously before any command leaves the system.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::model::DeviceSnapshot;

/// Global emergency-stop flag. Engaged forces the gate unsafe.
#[derive(Debug, Default)]
pub struct Estop(AtomicBool);

impl Estop {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn set(&self, engaged: bool) {
        self.0.store(engaged, Ordering::SeqCst);
    }

    pub fn engaged(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// System-safe predicate.
///
/// True iff the estop is not engaged, at least one device is online, and
/// every online device's latest safety report is safe. A fleet that has
/// never reported is unsafe (commands refused) but healthy.
pub fn is_system_safe(online_devices: &[DeviceSnapshot], estop_engaged: bool) -> bool {
    if estop_engaged || online_devices.is_empty() {
        return false;
    }
    online_devices.iter().all(DeviceSnapshot::is_safe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SafetyStatus;

    fn snapshot(id: &str, safety: Option<SafetyStatus>) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: id.into(),
            online: true,
            last_seen_at: 0.0,
            last_analysis_at: None,
            sample_count: 0,
            latest_sample: None,
            safety,
        }
    }

    fn safe_status(id: &str) -> SafetyStatus {
        SafetyStatus {
            device_id: id.into(),
            timestamp: 0.0,
            emergency_stop: false,
            door_closed: true,
            overload_detected: false,
            temperature_ok: true,
        }
    }

    #[test]
    fn no_devices_is_unsafe() {
        assert!(!is_system_safe(&[], false));
    }

    #[test]
    fn estop_forces_unsafe() {
        let devices = vec![snapshot("D1", Some(safe_status("D1")))];
        assert!(is_system_safe(&devices, false));
        assert!(!is_system_safe(&devices, true));
    }

    #[test]
    fn one_unsafe_device_trips_the_gate() {
        let mut bad = safe_status("D2");
        bad.overload_detected = true;
        let devices = vec![
            snapshot("D1", Some(safe_status("D1"))),
            snapshot("D2", Some(bad)),
        ];
        assert!(!is_system_safe(&devices, false));
    }

    #[test]
    fn device_without_safety_report_is_unsafe() {
        let devices = vec![snapshot("D1", None)];
        assert!(!is_system_safe(&devices, false));
    }

    #[test]
    fn estop_toggle_restores_prior_value() {
        let devices = vec![snapshot("D1", Some(safe_status("D1")))];
        let estop = Estop::new();
        let before = is_system_safe(&devices, estop.engaged());
        estop.set(true);
        assert!(!is_system_safe(&devices, estop.engaged()));
        estop.set(false);
        assert_eq!(is_system_safe(&devices, estop.engaged()), before);
    }
}
