//! Typed push-event channel
//!
//! The registry owns the sender; the WebSocket fan-out and any other
//! interested component subscribe. This keeps the registry free of any
//! reference to live sessions.

use serde::Serialize;
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel between registry and fan-out.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Kind of a push event, as seen on the WebSocket wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SensorData,
    SafetyStatus,
    AiAnalysis,
    SystemStatus,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SensorData => "sensor_data",
            EventKind::SafetyStatus => "safety_status",
            EventKind::AiAnalysis => "ai_analysis",
            EventKind::SystemStatus => "system_status",
        }
    }
}

/// One event pushed to real-time subscribers.
///
/// `device_id` is `None` for system-wide events (`system_status`).
#[derive(Debug, Clone, Serialize)]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub device_id: Option<String>,
    pub timestamp: f64,
    pub data: serde_json::Value,
}

impl PushEvent {
    pub fn new(
        kind: EventKind,
        device_id: Option<String>,
        timestamp: f64,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            device_id,
            timestamp,
            data,
        }
    }
}

/// Cloneable handle on the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PushEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns the number of live subscribers; zero is
    /// normal when no session is connected.
    pub fn publish(&self, event: PushEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}
