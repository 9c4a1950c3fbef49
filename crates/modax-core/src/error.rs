//! Core error taxonomy
//!
//! Recoverable errors stay local (counted and logged); only `ConfigError`
//! escalates to process exit.

use thiserror::Error;

/// Startup configuration failure. Always fatal (exit code 1).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("missing required option {field}: {reason}")]
    Missing { field: &'static str, reason: String },
}

/// Malformed or implausible payload. The message is dropped and counted.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("{field}[{index}] out of range: {value}")]
    ChannelOutOfRange {
        field: &'static str,
        index: usize,
        value: f64,
    },

    #[error("channel count mismatch for {field}: device established {expected}, got {got}")]
    ChannelMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("malformed payload: {0}")]
    Malformed(String),
}
