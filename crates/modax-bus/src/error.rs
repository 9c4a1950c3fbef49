//! Bus error taxonomy
//!
//! Transport errors are retried with backoff and surfaced on `/ready`;
//! publish failures are surfaced to the caller of `dispatch`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    /// Connection-level problem. Fatal only during the startup attempt
    /// budget; otherwise the driver keeps reconnecting.
    #[error("bus transport error: {0}")]
    Transport(String),

    /// Local queueing failed for a reason other than a full queue.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The bounded outbound queue is full.
    #[error("publish queue full (capacity {capacity})")]
    Backpressure { capacity: usize },
}
