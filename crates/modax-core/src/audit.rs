//! Security audit stream
//!
//! Append-only JSON-lines sink, separate from application logs. One object
//! per line; write failures are logged and never propagate.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

/// Audited event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Authentication,
    Authorization,
    ControlExecuted,
    ControlBlocked,
    ControlFailed,
    SafetyTransition,
    ConfigChange,
    /// A real-time session was closed because a safety event could not be
    /// queued.
    SessionOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

/// One audit record
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp_iso: String,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub actor: String,
    pub action: String,
    pub context: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        severity: AuditSeverity,
        actor: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp_iso: Utc::now().to_rfc3339(),
            event_type,
            severity,
            actor: actor.into(),
            action: action.into(),
            context: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

enum Target {
    Stdout,
    File(BufWriter<File>),
}

/// Serialized writer for the audit stream.
pub struct AuditSink {
    target: Mutex<Target>,
}

impl AuditSink {
    pub fn stdout() -> Self {
        Self {
            target: Mutex::new(Target::Stdout),
        }
    }

    pub fn file(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            target: Mutex::new(Target::File(BufWriter::new(file))),
        })
    }

    /// Emit one event as a single JSON line.
    pub fn emit(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("audit event serialization failed: {e}");
                return;
            }
        };

        let mut target = self.target.lock();
        let result = match &mut *target {
            Target::Stdout => {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                writeln!(out, "{line}").and_then(|_| out.flush())
            }
            Target::File(w) => writeln!(w, "{line}").and_then(|_| w.flush()),
        };
        if let Err(e) = result {
            tracing::error!("audit sink write failed: {e}");
        }
    }
}
