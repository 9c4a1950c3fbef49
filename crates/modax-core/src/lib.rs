//! MODAX control layer core
//!
//! Domain model, configuration, per-device registry/aggregation, safety
//! gate, TTL cache, audit stream, and metric names. Transport and API
//! surfaces live in the sibling crates; everything they share lives here.

pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics_names;
pub mod model;
pub mod registry;
pub mod safety;

pub use cache::{CacheStats, TtlCache};
pub use config::Config;
pub use error::{ConfigError, ValidationError};
pub use events::{EventBus, EventKind, PushEvent};
pub use model::{
    AdvisoryResult, Aggregate, AxisStats, CommandRequest, DeviceSnapshot, SafetyStatus,
    SensorSample, Vibration,
};
pub use registry::{unix_now, DeviceRegistry, RegistryConfig};
pub use safety::{is_system_safe, Estop};
