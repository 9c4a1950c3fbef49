//! MODAX bus client
//!
//! Publish/subscribe capability with an MQTT reference transport. The
//! transport keeps its session alive with jittered exponential backoff,
//! re-registers subscriptions across reconnects, and buffers outbound
//! publishes in a bounded queue.

pub mod error;
pub mod mqtt;
pub mod testing;
pub mod topics;
pub mod transport;

pub use error::BusError;
pub use mqtt::{MqttSettings, MqttTransport};
pub use transport::{BusTransport, ConnectionState, MessageHandler, QosLevel};
