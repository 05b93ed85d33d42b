mod app;
mod cli;

use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use app::AppState;
use beskar7_config::load_settings;
use beskar7_controllers::{
    ClusterReconciler, Context, ControllerRunner, HostReconciler, MachineReconciler,
    RedfishJobRunner,
};
use beskar7_coordinator::{ClaimCoordinator, LeaderGate};
use beskar7_metrics::Metrics;
use beskar7_queue::ProvisioningQueue;
use beskar7_redfish::{ClientCache, HttpRedfishFactory};
use beskar7_store::InMemoryStore;
use clap::Parser;
use cli::{parse_bind_address, Cli};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Hard ceiling on shutdown: drain the queue, relinquish the lease, stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let metrics_addr = parse_bind_address(&cli.metrics_bind_address)
        .map_err(anyhow::Error::msg)
        .context("--metrics-bind-address")?;
    let health_addr = parse_bind_address(&cli.health_probe_bind_address)
        .map_err(anyhow::Error::msg)
        .context("--health-probe-bind-address")?;

    let mut settings = load_settings(cli.config_file.as_deref())?;
    if let Some(d) = cli.leader_elect_lease_duration {
        settings.leader.lease_duration = d;
    }
    if let Some(d) = cli.leader_elect_renew_deadline {
        settings.leader.renew_deadline = d;
    }
    if let Some(d) = cli.leader_elect_retry_period {
        settings.leader.retry_period = d;
    }
    let settings = Arc::new(settings);
    info!(environment = ?settings.environment, namespace = %cli.namespace, "starting beskar7 manager");

    if cli.enable_webhook {
        warn!(
            port = cli.webhook_port,
            "admission webhooks are served by the webhook deployment; flag accepted and ignored"
        );
    }

    // Core wiring.
    let store = Arc::new(InMemoryStore::new());
    let metrics = Arc::new(Metrics::new());
    let gate = Arc::new(LeaderGate::new(store.clone(), &settings.leader, metrics.clone()));
    let coordinator = Arc::new(ClaimCoordinator::new(store.clone(), gate.clone(), metrics.clone()));
    let queue = ProvisioningQueue::new(settings.queue.clone(), metrics.clone());
    let ctx = Arc::new(Context {
        store,
        redfish: Arc::new(ClientCache::new(Arc::new(HttpRedfishFactory))),
        queue: queue.clone(),
        coordinator,
        metrics: metrics.clone(),
        settings: settings.clone(),
        namespace: cli.namespace.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Queue dispatcher and (optionally) lease renewal.
    let runner = RedfishJobRunner::new(ctx.clone());
    tokio::spawn(queue.clone().run(runner, shutdown_rx.clone()));
    if cli.leader_elect {
        let gate = gate.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { gate.run(rx).await });
    }

    // Controllers.
    let workers = settings.controller.max_concurrent_reconciles;
    let resync = settings.controller.requeue_interval;
    let error_requeue = settings.controller.requeue_after_error;
    for runner in [
        ControllerRunner::new(
            Arc::new(HostReconciler::new(ctx.clone())),
            workers,
            resync,
            error_requeue,
            metrics.clone(),
        ),
        ControllerRunner::new(
            Arc::new(MachineReconciler::new(ctx.clone())),
            workers,
            resync,
            error_requeue,
            metrics.clone(),
        ),
        ControllerRunner::new(
            Arc::new(ClusterReconciler::new(ctx.clone())),
            workers,
            resync,
            error_requeue,
            metrics.clone(),
        ),
    ] {
        tokio::spawn(runner.run(shutdown_rx.clone()));
    }

    // Probe and metrics endpoints.
    let state = AppState { metrics, ready: Arc::new(AtomicBool::new(false)) };
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("binding health endpoint {health_addr}"))?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("binding metrics endpoint {metrics_addr}"))?;
    info!(health = %health_addr, metrics = %metrics_addr, "serving probes and metrics");

    let mut health_rx = shutdown_rx.clone();
    tokio::spawn(
        axum::serve(health_listener, app::build_health_app(state.clone()))
            .with_graceful_shutdown(async move {
                let _ = health_rx.changed().await;
            })
            .into_future(),
    );
    let mut metrics_rx = shutdown_rx.clone();
    tokio::spawn(
        axum::serve(metrics_listener, app::build_metrics_app(state.clone()))
            .with_graceful_shutdown(async move {
                let _ = metrics_rx.changed().await;
            })
            .into_future(),
    );

    state.ready.store(true, Ordering::SeqCst);
    info!("manager ready");

    wait_for_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    if !queue.drain(SHUTDOWN_GRACE).await {
        warn!("queue did not drain within the grace period");
    }
    if cli.leader_elect {
        let _ = gate.relinquish().await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
