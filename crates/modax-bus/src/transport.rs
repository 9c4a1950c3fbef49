//! Bus transport capability
//!
//! The control layer is polymorphic over the underlying publish/subscribe
//! transport. MQTT is the reference implementation; an alternative (e.g.
//! Sparkplug-B) would implement this trait without touching registry or API
//! semantics.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BusError;

/// Inbound message callback: `(topic, payload)`.
///
/// Handlers run on the bus driver task and must complete synchronously:
/// no I/O, no long-held locks.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Connection state machine:
/// `Disconnected -> Connecting -> Connected -> Reconnecting -> ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    /// Numeric encoding for the `bus_connection_state` gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Reconnecting => 3.0,
        }
    }
}

/// The bus capability: connect, subscribe, publish, disconnect.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Establish the first session. Blocks until connected or the startup
    /// attempt budget is exhausted.
    async fn connect(&self) -> Result<(), BusError>;

    /// Register a handler for a topic filter at the given QoS. Subscriptions
    /// survive reconnects: the transport re-issues them on every new session.
    async fn subscribe(
        &self,
        pattern: &str,
        qos: QosLevel,
        handler: MessageHandler,
    ) -> Result<(), BusError>;

    /// Queue a publish. Fails only when local queueing failed; transient
    /// disconnection buffers instead.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QosLevel)
        -> Result<(), BusError>;

    /// Tear down the session. Idempotent.
    async fn disconnect(&self);

    fn state(&self) -> ConnectionState;

    /// Wall time (unix seconds) of the most recent successful session, used
    /// by the readiness probe.
    fn last_connected_at(&self) -> Option<f64>;
}
