//! MQTT reference transport (rumqttc)
//!
//! A single driver task owns the event loop: it dispatches inbound publishes
//! to registered handlers, re-issues subscriptions on every ConnAck, and
//! paces reconnects with jittered exponential backoff. Outbound publishes
//! flow through rumqttc's bounded request queue, which doubles as the single
//! writer queue required by the concurrency model.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, LastWill, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use modax_core::config::MqttConfig;
use modax_core::metrics_names;
use modax_core::registry::unix_now;

use crate::error::BusError;
use crate::topics;
use crate::transport::{BusTransport, ConnectionState, MessageHandler, QosLevel};

/// First reconnect delay.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Ceiling for the reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Bounded outbound queue depth.
pub const PUBLISH_QUEUE_CAPACITY: usize = 10_000;

/// Exponential backoff base delay: `min(max, initial * 2^attempt)`.
pub fn base_reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.min(6); // 2^6 s already exceeds the 60 s ceiling
    let delay = INITIAL_RECONNECT_DELAY * 2u32.pow(exp);
    delay.min(MAX_RECONNECT_DELAY)
}

/// Backoff delay with ±20 % jitter.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base_reconnect_delay(attempt).mul_f64(factor)
}

fn to_mqtt_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// MQTT transport settings, derived from [`MqttConfig`].
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub ca_certs: Option<std::path::PathBuf>,
    pub certfile: Option<std::path::PathBuf>,
    pub keyfile: Option<std::path::PathBuf>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_attempts: u32,
}

impl MqttSettings {
    pub fn from_config(cfg: &MqttConfig, client_id: impl Into<String>) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            use_tls: cfg.use_tls,
            ca_certs: cfg.ca_certs.clone(),
            certfile: cfg.certfile.clone(),
            keyfile: cfg.keyfile.clone(),
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(30),
            connect_attempts: cfg.connect_attempts,
        }
    }
}

struct Subscription {
    pattern: String,
    qos: QosLevel,
    handler: MessageHandler,
}

struct Shared {
    client: AsyncClient,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: RwLock<Vec<Subscription>>,
    last_connected: Mutex<Option<f64>>,
    initial_failures: AtomicU32,
    ever_connected: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        metrics::gauge!(metrics_names::BUS_CONNECTION_STATE).set(state.gauge_value());
        // watch::send only fails with no receivers; we always hold one.
        let _ = self.state_tx.send(state);
    }
}

/// MQTT-backed [`BusTransport`].
pub struct MqttTransport {
    settings: MqttSettings,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
    eventloop: Mutex<Option<EventLoop>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    disconnected: AtomicBool,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Result<Self, BusError> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(false);
        options.set_last_will(LastWill::new(
            topics::NODE_STATUS,
            b"offline".to_vec(),
            QoS::AtLeastOnce,
            true,
        ));
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        if settings.use_tls {
            let ca_path = settings.ca_certs.as_ref().ok_or_else(|| {
                BusError::Transport("MQTT TLS enabled without CA certificate".into())
            })?;
            let ca = std::fs::read(ca_path)
                .map_err(|e| BusError::Transport(format!("read CA certs: {e}")))?;
            let client_auth = match (&settings.certfile, &settings.keyfile) {
                (Some(cert), Some(key)) => {
                    let cert = std::fs::read(cert)
                        .map_err(|e| BusError::Transport(format!("read client cert: {e}")))?;
                    let key = std::fs::read(key)
                        .map_err(|e| BusError::Transport(format!("read client key: {e}")))?;
                    Some((cert, key))
                }
                _ => None,
            };
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }

        let (client, eventloop) = AsyncClient::new(options, PUBLISH_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            settings,
            shared: Arc::new(Shared {
                client,
                state_tx,
                subscriptions: RwLock::new(Vec::new()),
                last_connected: Mutex::new(None),
                initial_failures: AtomicU32::new(0),
                ever_connected: AtomicBool::new(false),
            }),
            state_rx,
            eventloop: Mutex::new(Some(eventloop)),
            shutdown_tx,
            shutdown_rx,
            disconnected: AtomicBool::new(false),
        })
    }

    fn spawn_driver(&self) {
        let Some(eventloop) = self.eventloop.lock().take() else {
            return; // already running
        };
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(drive(shared, eventloop, shutdown));
    }
}

/// Driver task: pumps the event loop until shutdown.
async fn drive(shared: Arc<Shared>, mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    shared.set_state(ConnectionState::Connecting);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("bus driver shutting down");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    attempt = 0;
                    shared.ever_connected.store(true, Ordering::SeqCst);
                    *shared.last_connected.lock() = Some(unix_now());
                    shared.set_state(ConnectionState::Connected);
                    info!("bus connected to broker");

                    // Re-subscribe on every (re)connect: the broker may have
                    // lost the session even with clean_session(false).
                    let subs: Vec<(String, QosLevel)> = shared
                        .subscriptions
                        .read()
                        .iter()
                        .map(|s| (s.pattern.clone(), s.qos))
                        .collect();
                    for (pattern, qos) in subs {
                        if let Err(e) = shared
                            .client
                            .subscribe(pattern.clone(), to_mqtt_qos(qos))
                            .await
                        {
                            error!(topic = %pattern, "re-subscribe failed: {e}");
                        }
                    }

                    // Retained online announcement.
                    if let Err(e) = shared
                        .client
                        .try_publish(topics::NODE_STATUS, QoS::AtLeastOnce, true, b"online".to_vec())
                    {
                        warn!("online announcement failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    metrics::counter!(
                        metrics_names::BUS_MESSAGES_RECEIVED_TOTAL,
                        "topic" => publish.topic.clone()
                    )
                    .increment(1);

                    let handlers = shared.subscriptions.read();
                    for sub in handlers.iter() {
                        if topics::topic_matches(&sub.pattern, &publish.topic) {
                            (sub.handler)(&publish.topic, &publish.payload);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("broker sent disconnect");
                    shared.set_state(ConnectionState::Disconnected);
                }
                Ok(_) => {}
                Err(e) => {
                    if !shared.ever_connected.load(Ordering::SeqCst) {
                        shared.initial_failures.fetch_add(1, Ordering::SeqCst);
                        shared.set_state(ConnectionState::Connecting);
                    } else {
                        shared.set_state(ConnectionState::Reconnecting);
                    }

                    let delay = reconnect_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "bus connection error: {e}"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    shared.set_state(ConnectionState::Disconnected);
}

#[async_trait::async_trait]
impl BusTransport for MqttTransport {
    async fn connect(&self) -> Result<(), BusError> {
        self.spawn_driver();

        let mut state_rx = self.state_rx.clone();
        loop {
            if *state_rx.borrow() == ConnectionState::Connected {
                return Ok(());
            }
            let failures = self.shared.initial_failures.load(Ordering::SeqCst);
            if failures >= self.settings.connect_attempts {
                return Err(BusError::Transport(format!(
                    "broker unreachable after {failures} attempts"
                )));
            }
            if state_rx.changed().await.is_err() {
                return Err(BusError::Transport("bus driver exited".into()));
            }
        }
    }

    async fn subscribe(
        &self,
        pattern: &str,
        qos: QosLevel,
        handler: MessageHandler,
    ) -> Result<(), BusError> {
        self.shared.subscriptions.write().push(Subscription {
            pattern: pattern.to_string(),
            qos,
            handler,
        });

        // If a session is already up, subscribe now; otherwise the ConnAck
        // handler will issue it.
        if *self.state_rx.borrow() == ConnectionState::Connected {
            self.shared
                .client
                .subscribe(pattern, to_mqtt_qos(qos))
                .await
                .map_err(|e| BusError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
    ) -> Result<(), BusError> {
        let result = self
            .shared
            .client
            .try_publish(topic, to_mqtt_qos(qos), false, payload);

        let outcome = match &result {
            Ok(()) => "ok",
            Err(ClientError::TryRequest(_)) => "backpressure",
            Err(_) => "error",
        };
        metrics::counter!(
            metrics_names::BUS_PUBLISH_TOTAL,
            "topic" => topic.to_string(),
            "result" => outcome
        )
        .increment(1);

        result.map_err(|e| match e {
            ClientError::TryRequest(_) => BusError::Backpressure {
                capacity: PUBLISH_QUEUE_CAPACITY,
            },
            other => BusError::Publish(other.to_string()),
        })
    }

    async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        // Best-effort node-death announcement before the session drops.
        let _ = self.shared.client.try_publish(
            topics::NODE_STATUS,
            QoS::AtLeastOnce,
            true,
            b"offline".to_vec(),
        );
        let _ = self.shared.client.disconnect().await;
        let _ = self.shutdown_tx.send(true);
        self.shared.set_state(ConnectionState::Disconnected);
    }

    fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn last_connected_at(&self) -> Option<f64> {
        *self.shared.last_connected.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        assert_eq!(base_reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(base_reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(base_reconnect_delay(2), Duration::from_secs(4));
        assert_eq!(base_reconnect_delay(3), Duration::from_secs(8));
        assert_eq!(base_reconnect_delay(6), Duration::from_secs(60));
        assert_eq!(base_reconnect_delay(12), Duration::from_secs(60));
        assert_eq!(base_reconnect_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for attempt in 0..8 {
            let base = base_reconnect_delay(attempt);
            for _ in 0..100 {
                let d = reconnect_delay(attempt);
                assert!(d >= base.mul_f64(0.8), "{d:?} below jitter floor");
                assert!(d <= base.mul_f64(1.2), "{d:?} above jitter ceiling");
            }
        }
    }

    #[tokio::test]
    async fn publish_before_connect_queues_locally() {
        // No broker anywhere near this port; the request should still be
        // accepted into the bounded local queue.
        let transport = MqttTransport::new(MqttSettings {
            host: "127.0.0.1".into(),
            port: 1,
            username: None,
            password: None,
            use_tls: false,
            ca_certs: None,
            certfile: None,
            keyfile: None,
            client_id: "modax-test".into(),
            keep_alive: Duration::from_secs(30),
            connect_attempts: 1,
        })
        .unwrap();

        transport
            .publish(topics::SENSOR_DATA, b"{}".to_vec(), QosLevel::AtMostOnce)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let transport = MqttTransport::new(MqttSettings {
            host: "127.0.0.1".into(),
            port: 1,
            username: None,
            password: None,
            use_tls: false,
            ca_certs: None,
            certfile: None,
            keyfile: None,
            client_id: "modax-test".into(),
            keep_alive: Duration::from_secs(30),
            connect_attempts: 1,
        })
        .unwrap();

        transport.disconnect().await;
        transport.disconnect().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
