//! MODAX advisory integration
//!
//! HTTP client for the external advisory service plus the periodic
//! orchestrator that feeds it aggregates and caches its results. The
//! advisory service is purely advisory: nothing here can block or issue a
//! control command.

pub mod client;
pub mod orchestrator;

pub use client::{AdvisoryClient, AdvisoryError, AdvisoryRequest};
pub use orchestrator::{advisory_cache_key, AdvisoryOrchestrator, OrchestratorSettings};
