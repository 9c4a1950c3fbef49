//! Advisory orchestrator
//!
//! A periodic tick selects eligible online devices, fans their aggregates
//! out to the advisory service under bounded concurrency, caches results,
//! and applies a per-device open-circuit rule. The tick also records each
//! online device's current aggregate into its history ring, whether or not
//! advisory analysis runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use modax_bus::{topics, BusTransport, QosLevel};
use modax_core::cache::TtlCache;
use modax_core::config::AdvisoryConfig;
use modax_core::events::{EventKind, PushEvent};
use modax_core::metrics_names;
use modax_core::registry::{unix_now, DeviceRegistry};
use modax_core::Aggregate;

use crate::client::{AdvisoryClient, AdvisoryRequest};

/// Cache key for a device's latest advisory result.
pub fn advisory_cache_key(device_id: &str) -> String {
    format!("advisory:{device_id}")
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Advisory calls enabled. History recording runs regardless.
    pub enabled: bool,
    pub interval: Duration,
    pub min_samples: usize,
    pub max_in_flight: usize,
    /// Consecutive failures that open a device's circuit.
    pub failure_threshold: u32,
    /// Cooldown while open, expressed in analysis intervals.
    pub cooldown_intervals: u32,
    pub cache_ttl: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AdvisoryConfig, cache_ttl: Duration) -> Self {
        Self {
            enabled: cfg.enabled,
            interval: cfg.interval,
            min_samples: cfg.min_samples,
            max_in_flight: cfg.max_in_flight,
            failure_threshold: 5,
            cooldown_intervals: 5,
            cache_ttl,
        }
    }
}

#[derive(Debug, Default)]
struct Circuit {
    consecutive_failures: u32,
    open_until: Option<f64>,
}

pub struct AdvisoryOrchestrator {
    settings: OrchestratorSettings,
    client: AdvisoryClient,
    registry: Arc<DeviceRegistry>,
    cache: Arc<TtlCache>,
    /// Echoes successful results onto `modax/ai/analysis` when present.
    bus: Option<Arc<dyn BusTransport>>,
    circuits: DashMap<String, Circuit>,
}

impl AdvisoryOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        client: AdvisoryClient,
        registry: Arc<DeviceRegistry>,
        cache: Arc<TtlCache>,
        bus: Option<Arc<dyn BusTransport>>,
    ) -> Self {
        Self {
            settings,
            client,
            registry,
            cache,
            bus,
            circuits: DashMap::new(),
        }
    }

    /// Scheduler loop. Shutdown cancels the in-flight tick; partial results
    /// of cancelled requests are discarded.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_s = self.settings.interval.as_secs(),
            enabled = self.settings.enabled,
            "advisory orchestrator started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = self.run_tick(unix_now()) => {}
                    }
                }
            }
        }
        info!("advisory orchestrator stopped");
    }

    /// One tick: record history, pick eligible devices, analyze them with
    /// bounded concurrency.
    pub async fn run_tick(&self, now: f64) {
        self.registry.record_aggregates_at(now);
        if !self.settings.enabled {
            return;
        }

        let eligible = self.eligible_devices(now);
        if eligible.is_empty() {
            return;
        }
        debug!(devices = eligible.len(), "advisory tick");

        stream::iter(eligible)
            .for_each_concurrent(self.settings.max_in_flight, |(device_id, aggregate)| async move {
                self.analyze_device(&device_id, &aggregate, now).await;
            })
            .await;
    }

    fn eligible_devices(&self, now: f64) -> Vec<(String, Aggregate)> {
        let interval = self.settings.interval.as_secs_f64();
        let mut eligible = Vec::new();

        for snap in self.registry.online_snapshots_at(now) {
            if snap.sample_count < self.settings.min_samples {
                continue;
            }
            if snap
                .last_analysis_at
                .map(|t| now - t < interval)
                .unwrap_or(false)
            {
                continue;
            }
            if self.circuit_open(&snap.device_id, now) {
                continue;
            }
            if let Some(agg) = self.registry.aggregate(&snap.device_id) {
                eligible.push((snap.device_id, agg));
            }
        }
        eligible
    }

    async fn analyze_device(&self, device_id: &str, aggregate: &Aggregate, now: f64) {
        let request = AdvisoryRequest::from_aggregate(device_id, aggregate);
        let started = Instant::now();
        let outcome = self.client.analyze(&request).await;
        metrics::histogram!(metrics_names::ADVISORY_REQUEST_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => {
                metrics::counter!(metrics_names::ADVISORY_REQUESTS_TOTAL, "result" => "ok")
                    .increment(1);

                let value = match serde_json::to_value(&result) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(device = %device_id, "advisory result serialization failed: {e}");
                        return;
                    }
                };
                self.cache
                    .put(advisory_cache_key(device_id), value.clone(), self.settings.cache_ttl);
                self.registry.set_last_analysis(device_id, now);
                self.circuits.remove(device_id);

                self.registry.events().publish(PushEvent::new(
                    EventKind::AiAnalysis,
                    Some(device_id.to_string()),
                    now,
                    value.clone(),
                ));

                // Echo onto the bus for HMIs subscribed there.
                if let Some(bus) = &self.bus {
                    if let Err(e) = bus
                        .publish(
                            topics::AI_ANALYSIS,
                            value.to_string().into_bytes(),
                            QosLevel::AtLeastOnce,
                        )
                        .await
                    {
                        warn!(device = %device_id, "advisory echo publish failed: {e}");
                    }
                }
            }
            Err(e) => {
                metrics::counter!(metrics_names::ADVISORY_REQUESTS_TOTAL, "result" => e.class())
                    .increment(1);
                warn!(device = %device_id, class = e.class(), "advisory request failed: {e}");
                self.record_failure(device_id, now);
            }
        }
    }

    fn circuit_open(&self, device_id: &str, now: f64) -> bool {
        self.circuits
            .get(device_id)
            .and_then(|c| c.open_until)
            .map(|until| now < until)
            .unwrap_or(false)
    }

    fn record_failure(&self, device_id: &str, now: f64) {
        let mut circuit = self.circuits.entry(device_id.to_string()).or_default();
        circuit.consecutive_failures += 1;
        if circuit.consecutive_failures >= self.settings.failure_threshold {
            let cooldown =
                self.settings.interval.as_secs_f64() * self.settings.cooldown_intervals as f64;
            circuit.open_until = Some(now + cooldown);
            warn!(
                device = %device_id,
                failures = circuit.consecutive_failures,
                cooldown_s = cooldown,
                "advisory circuit opened"
            );
        }
    }
}
