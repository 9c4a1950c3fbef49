//! MODAX gateway
//!
//! Versioned HTTP/WebSocket API over the registry and cache, safety-gated
//! command dispatch, and real-time fan-out. The binary in `main.rs` wires
//! configuration, observability, bus, orchestrator, and this surface
//! together with bounded graceful shutdown.

pub mod auth;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod handlers;
pub mod ingress;
pub mod middleware;
pub mod rate_limit;
pub mod server;
pub mod state;
pub mod ws;

pub use error::{ApiError, ErrorKind};
pub use state::AppState;
