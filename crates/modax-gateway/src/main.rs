//! MODAX control layer entry point
//!
//! Startup order: config → observability → state (cache, registry, audit)
//! → bus connect → advisory orchestrator → fan-out → API. SIGINT/SIGTERM
//! trigger bounded graceful shutdown; SIGHUP is ignored.
//!
//! Exit codes: 0 normal, 1 configuration error, 2 bus unreachable at
//! startup, 3 fatal internal error.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{error, info, warn};

use modax_advisory::{AdvisoryClient, AdvisoryOrchestrator, OrchestratorSettings};
use modax_bus::{BusTransport, MqttSettings, MqttTransport};
use modax_core::config::LogConfig;
use modax_core::metrics_names;
use modax_core::registry::unix_now;
use modax_core::Config;
use modax_gateway::{ingress, server, AppState};

const CLIENT_ID: &str = "modax-control-layer";

#[derive(Parser, Debug)]
#[command(name = "modax-gateway")]
#[command(about = "MODAX control layer - SCADA middleware gateway")]
#[command(version)]
struct Args {
    /// Override API_PORT from the environment
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_tracing(cfg: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    if cfg.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(mut cfg) => {
            if let Some(port) = args.port {
                cfg.api.port = port;
            }
            Arc::new(cfg)
        }
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.log);

    let metrics_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            error!("metrics recorder installation failed: {e}");
            std::process::exit(3);
        }
    };
    metrics_names::describe();

    if let Err(code) = run(config, metrics_handle).await {
        std::process::exit(code);
    }
}

async fn run(
    config: Arc<Config>,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
) -> Result<(), i32> {
    // ── Bus transport ───────────────────────────────────────────────
    let transport = MqttTransport::new(MqttSettings::from_config(&config.mqtt, CLIENT_ID))
        .map_err(|e| {
            error!("bus transport setup failed: {e}");
            1
        })?;
    let bus: Arc<dyn BusTransport> = Arc::new(transport);

    // ── Shared state ────────────────────────────────────────────────
    let state = AppState::new(Arc::clone(&config), Arc::clone(&bus), metrics_handle)
        .map_err(|e| {
            error!("state initialization failed: {e}");
            3
        })?;

    // Subscriptions must be registered before connect so the first ConnAck
    // issues them.
    ingress::wire(&state).await.map_err(|e| {
        error!("bus subscription failed: {e}");
        2
    })?;

    info!(
        host = %config.mqtt.host,
        port = config.mqtt.port,
        "connecting to bus"
    );
    bus.connect().await.map_err(|e| {
        error!("bus unreachable at startup: {e}");
        2
    })?;

    // ── Background tasks ────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = Arc::new(AdvisoryOrchestrator::new(
        OrchestratorSettings::from_config(&config.advisory, config.advisory_cache_ttl()),
        AdvisoryClient::new(config.advisory.url.clone(), config.advisory.timeout),
        Arc::clone(&state.registry),
        Arc::clone(&state.cache),
        Some(Arc::clone(&bus)),
    ));
    let orchestrator_task = tokio::spawn(orchestrator.run(shutdown_rx.clone()));

    let fanout_task = tokio::spawn(
        Arc::clone(&state.fanout).run(state.registry.events().clone(), shutdown_rx.clone()),
    );

    let gauge_task = tokio::spawn(gauge_updater(state.clone(), shutdown_rx.clone()));

    let server_state = state.clone();
    let server_task = tokio::spawn(server::serve(server_state, shutdown_rx.clone()));

    // ── Signals ─────────────────────────────────────────────────────
    // SIGHUP is explicitly ignored: no live reload.
    if let Ok(mut sighup) =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
    {
        tokio::spawn(async move {
            while sighup.recv().await.is_some() {
                info!("SIGHUP ignored (no live reload)");
            }
        });
    }

    let reason = wait_for_shutdown_signal().await;
    info!(signal = reason, "shutting down");

    // ── Bounded graceful shutdown ───────────────────────────────────
    let _ = shutdown_tx.send(true);
    let drained = tokio::time::timeout(config.shutdown_grace, async {
        let _ = server_task.await;
        let _ = orchestrator_task.await;
        let _ = fanout_task.await;
    })
    .await;
    if drained.is_err() {
        warn!(
            grace_s = config.shutdown_grace.as_secs(),
            "shutdown grace period expired, force-terminating remaining tasks"
        );
    }
    gauge_task.abort();

    // Publishes the retained offline announcement before dropping the
    // session.
    bus.disconnect().await;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() -> &'static str {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = &mut ctrl_c => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
            "SIGINT"
        }
    }
}

/// Refresh slow gauges and push a `system_status` heartbeat every 5 s.
async fn gauge_updater(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let now = unix_now();
                state.update_gauges(now);
                state.publish_system_status(now);
            }
        }
    }
}
