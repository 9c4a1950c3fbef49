//! Real-time fan-out
//!
//! Long-lived WebSocket sessions receive ordered push events, globally or
//! scoped to one device. Each session owns a bounded queue drained by a
//! dedicated writer task; producers enqueue without blocking. When a queue
//! overflows, the oldest non-safety message goes first; a safety event that
//! cannot be queued closes the session instead of being dropped silently.

use std::borrow::Cow;
use std::collections::VecDeque;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path, State};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use modax_core::audit::{AuditEvent, AuditEventType, AuditSeverity, AuditSink};
use modax_core::events::{EventBus, EventKind, PushEvent};
use modax_core::metrics_names;

use crate::auth::{AuthContext, Permission};
use crate::error::ApiError;
use crate::state::AppState;

/// WebSocket close code sent when a safety event could not be queued
/// (1013 "try again later").
pub const CLOSE_CODE_BACKPRESSURE: u16 = 1013;

/// What a session listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionScope {
    Global,
    Device(String),
}

impl SessionScope {
    /// Device-scoped sessions still receive system-wide events.
    fn matches(&self, event: &PushEvent) -> bool {
        match self {
            SessionScope::Global => true,
            SessionScope::Device(id) => {
                event.kind == EventKind::SystemStatus
                    || event.device_id.as_deref() == Some(id.as_str())
            }
        }
    }
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// The event went in, but an older non-safety event was dropped.
    EnqueuedWithDrop,
    /// The incoming non-safety event itself was dropped.
    Dropped,
    /// A safety event could not be accepted: the session must close.
    Overflowed,
}

struct QueueInner {
    buf: VecDeque<PushEvent>,
    closed: bool,
    overflowed: bool,
    dropped: u64,
}

/// Bounded per-session queue with the safety-aware drop policy.
pub struct SessionQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl SessionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner {
                buf: VecDeque::new(),
                closed: false,
                overflowed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, event: PushEvent) -> PushOutcome {
        let mut q = self.inner.lock();
        if q.closed {
            return PushOutcome::Dropped;
        }

        let mut dropped_one = false;
        if q.buf.len() >= self.capacity {
            if let Some(pos) = q.buf.iter().position(|e| e.kind != EventKind::SafetyStatus) {
                q.buf.remove(pos);
                q.dropped += 1;
                dropped_one = true;
                metrics::counter!(metrics_names::WS_MESSAGES_DROPPED_TOTAL).increment(1);
            } else if event.kind == EventKind::SafetyStatus {
                // Full of safety events and another arrives: close rather
                // than drop it silently.
                q.closed = true;
                q.overflowed = true;
                drop(q);
                self.notify.notify_waiters();
                return PushOutcome::Overflowed;
            } else {
                q.dropped += 1;
                metrics::counter!(metrics_names::WS_MESSAGES_DROPPED_TOTAL).increment(1);
                return PushOutcome::Dropped;
            }
        }

        q.buf.push_back(event);
        drop(q);
        self.notify.notify_one();
        if dropped_one {
            PushOutcome::EnqueuedWithDrop
        } else {
            PushOutcome::Enqueued
        }
    }

    /// Next event in FIFO order; `None` once the queue is closed.
    pub async fn pop(&self) -> Option<PushEvent> {
        loop {
            {
                let mut q = self.inner.lock();
                if q.closed {
                    return None;
                }
                if let Some(event) = q.buf.pop_front() {
                    return Some(event);
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn overflowed(&self) -> bool {
        self.inner.lock().overflowed
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

pub struct SessionHandle {
    pub scope: SessionScope,
    pub queue: SessionQueue,
}

/// Session registry plus the distribution task feeding every queue.
pub struct FanoutHub {
    sessions: DashMap<Uuid, Arc<SessionHandle>>,
    queue_capacity: usize,
    max_connections: usize,
    audit: Arc<AuditSink>,
}

impl FanoutHub {
    pub fn new(max_connections: usize, queue_capacity: usize, audit: Arc<AuditSink>) -> Self {
        Self {
            sessions: DashMap::new(),
            queue_capacity,
            max_connections,
            audit,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Register a session, or `None` at the connection cap.
    pub fn register(&self, scope: SessionScope) -> Option<(Uuid, Arc<SessionHandle>)> {
        if self.sessions.len() >= self.max_connections {
            return None;
        }
        let id = Uuid::now_v7();
        let handle = Arc::new(SessionHandle {
            scope,
            queue: SessionQueue::new(self.queue_capacity),
        });
        self.sessions.insert(id, Arc::clone(&handle));
        metrics::gauge!(metrics_names::WS_SESSIONS).set(self.sessions.len() as f64);
        Some((id, handle))
    }

    pub fn unregister(&self, id: &Uuid) {
        self.sessions.remove(id);
        metrics::gauge!(metrics_names::WS_SESSIONS).set(self.sessions.len() as f64);
    }

    /// Fan one event out to every matching session.
    pub fn dispatch(&self, event: &PushEvent) {
        for entry in self.sessions.iter() {
            let handle = entry.value();
            if !handle.scope.matches(event) {
                continue;
            }
            if handle.queue.push(event.clone()) == PushOutcome::Overflowed {
                self.audit.emit(
                    AuditEvent::new(
                        AuditEventType::SessionOverflow,
                        AuditSeverity::Warning,
                        "fan-out",
                        "closed session: safety event could not be queued",
                    )
                    .with("session_id", entry.key().to_string()),
                );
            }
        }
    }

    /// Distribution loop: drains the registry's event channel until
    /// shutdown.
    pub async fn run(self: Arc<Self>, events: EventBus, mut shutdown: watch::Receiver<bool>) {
        let mut rx = events.subscribe();
        info!("fan-out hub started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = rx.recv() => match received {
                    Ok(event) => self.dispatch(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "fan-out lagged behind the event channel");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        // Wake every writer so sessions close promptly.
        for entry in self.sessions.iter() {
            entry.value().queue.close();
        }
        info!("fan-out hub stopped");
    }
}

// ============================================================================
// HTTP handlers
// ============================================================================

pub async fn ws_global(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, ctx, ws, SessionScope::Global)
}

pub async fn ws_device(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(device_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, ctx, ws, SessionScope::Device(device_id))
}

fn upgrade(state: AppState, ctx: AuthContext, ws: WebSocketUpgrade, scope: SessionScope) -> Response {
    if let Err(e) = state.require_permission(&ctx, Permission::Read) {
        return e.into_response();
    }
    let Some((session_id, handle)) = state.fanout.register(scope) else {
        return ApiError::unavailable("websocket connection cap reached").into_response();
    };
    let fanout = Arc::clone(&state.fanout);
    ws.on_upgrade(move |socket| run_session(fanout, session_id, handle, socket))
}

/// Writer loop: drains the session queue into the socket; reads only to
/// notice client closes.
async fn run_session(
    fanout: Arc<FanoutHub>,
    session_id: Uuid,
    handle: Arc<SessionHandle>,
    socket: WebSocket,
) {
    debug!(session = %session_id, "websocket session opened");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = handle.queue.pop() => match event {
                Some(event) => {
                    let Ok(json) = serde_json::to_string(&event) else { continue };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                None => {
                    if handle.queue.overflowed() {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_CODE_BACKPRESSURE,
                                reason: Cow::from("safety event could not be queued"),
                            })))
                            .await;
                    }
                    break;
                }
            },
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {} // clients send nothing we act on
            }
        }
    }

    handle.queue.close();
    fanout.unregister(&session_id);
    debug!(session = %session_id, "websocket session closed");
}
