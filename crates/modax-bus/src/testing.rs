//! In-memory transport for tests
//!
//! Records publishes, lets tests inject inbound messages through registered
//! handlers, and can be switched into failure modes to exercise error paths.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use modax_core::registry::unix_now;

use crate::error::BusError;
use crate::topics::topic_matches;
use crate::transport::{BusTransport, ConnectionState, MessageHandler, QosLevel};

/// One recorded publish.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
}

/// Loopback [`BusTransport`] used by unit and integration tests.
#[derive(Default)]
pub struct MockTransport {
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: RwLock<Vec<(String, MessageHandler)>>,
    state: RwLock<Option<f64>>,
    fail_publish: AtomicBool,
    backpressure: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail with `PublishError`.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make every publish fail with `BackpressureError`.
    pub fn backpressure(&self, on: bool) {
        self.backpressure.store(on, Ordering::SeqCst);
    }

    /// Deliver an inbound message to every matching handler, as the broker
    /// would.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        let handlers = self.subscriptions.read();
        for (pattern, handler) in handlers.iter() {
            if topic_matches(pattern, topic) {
                handler(topic, payload);
            }
        }
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    /// Publishes on one topic (prefix match so device-scoped topics count).
    pub fn published_on(&self, topic_prefix: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic.starts_with(topic_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl BusTransport for MockTransport {
    async fn connect(&self) -> Result<(), BusError> {
        *self.state.write() = Some(unix_now());
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        _qos: QosLevel,
        handler: MessageHandler,
    ) -> Result<(), BusError> {
        self.subscriptions
            .write()
            .push((pattern.to_string(), handler));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
    ) -> Result<(), BusError> {
        if self.backpressure.load(Ordering::SeqCst) {
            return Err(BusError::Backpressure { capacity: 0 });
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish("mock publish failure".into()));
        }
        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        *self.state.write() = None;
    }

    fn state(&self) -> ConnectionState {
        if self.state.read().is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn last_connected_at(&self) -> Option<f64> {
        *self.state.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn inject_reaches_matching_handlers() {
        let bus = MockTransport::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe(
            "modax/sensor/data",
            QosLevel::AtMostOnce,
            Arc::new(move |topic, _| sink.lock().push(topic.to_string())),
        )
        .await
        .unwrap();

        bus.inject("modax/sensor/data", b"{}");
        bus.inject("modax/sensor/safety", b"{}");

        assert_eq!(seen.lock().as_slice(), ["modax/sensor/data"]);
    }

    #[tokio::test]
    async fn publishes_are_recorded() {
        let bus = MockTransport::new();
        bus.publish("modax/control/commands/D1", b"x".to_vec(), QosLevel::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(bus.published_on("modax/control/commands").len(), 1);
    }
}
