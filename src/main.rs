//! Broker Marketplace server
//!
//! Serves the marketplace API, runs the webhook delivery worker and,
//! when enabled, the in-process reconciler schedule.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use marketplace_api::{config::ApiConfig, config::LoggingConfig, ApiServer, AppState};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Extra configuration file, layered over marketplace.toml
    #[arg(short, long, env = "MARKETPLACE_CONFIG_FILE")]
    config: Option<String>,

    /// Override the configured bind address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = ApiConfig::load(args.config.as_deref()).context("Invalid configuration")?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging)?;
    info!("Starting broker marketplace v{}", env!("CARGO_PKG_VERSION"));
    config.log_summary();

    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
    let metrics_handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder))
        .map_err(|e| anyhow::anyhow!("Failed to set metrics recorder: {}", e))?;
    info!("Prometheus metrics recorder initialized");

    let poll_interval = config.webhook.poll_interval();
    let scheduler = config.scheduler.clone();
    let state = AppState::from_config(config)
        .await
        .context("Failed to initialize application state")?
        .with_metrics(metrics_handle);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = state.webhook_worker.clone();
    let worker_handle = tokio::spawn(worker.run(poll_interval, shutdown_rx.clone()));

    let scheduler_handle = if scheduler.enabled {
        let interval = Duration::from_secs(scheduler.reconcile_interval_secs);
        Some(tokio::spawn(run_scheduler(
            state.clone(),
            interval,
            shutdown_rx,
        )))
    } else {
        info!("In-process scheduler disabled; reconciler jobs run via /api/v1/cron");
        None
    };

    let server = ApiServer::new(state);
    let served = server.serve(shutdown_signal()).await;

    info!("Shutting down background workers...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_handle.await {
        error!("Webhook worker task failed: {}", e);
    }
    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            error!("Scheduler task failed: {}", e);
        }
    }

    served?;
    info!("Broker marketplace shut down gracefully");
    Ok(())
}

/// Runs every reconciler job on a fixed interval until shutdown.
async fn run_scheduler(state: AppState, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(?interval, "Reconciler scheduler started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for summary in state.reconciler.run_all(Utc::now()).await {
                    info!(job = %summary.job, actions = ?summary.actions, "Reconciler job finished");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Reconciler scheduler stopped");
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    let json_stdout = logging.structured.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
    });
    let plain_stdout = (!logging.structured).then(fmt::layer);

    let file_layer = if logging.log_to_file {
        let directory = logging.log_file_path.as_deref().unwrap_or("logs");
        let file_appender = tracing_appender::rolling::daily(directory, "broker-marketplace.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // The guard flushes on drop; it has to outlive every log call.
        Box::leak(Box::new(guard));
        Some(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_current_span(true)
                .with_span_list(true),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_stdout)
        .with(plain_stdout)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal (Ctrl+C)"),
        Err(err) => warn!("Failed to listen for shutdown signal: {:?}", err),
    }
}
