//! ---
//! lw_section: "01-core-functionality"
//! lw_subsection: "binary"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Binary entrypoint for the LoadWatch daemon."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use lw_acquire::{AdcSource, Calibration, SyntheticMains};
use lw_bus::{Broker, BusMetrics};
use lw_common::config::AppConfig;
use lw_common::logging::init_tracing;
use lw_common::OperatingMode;
use lw_control::MeterNode;
use lw_metrics::{
    new_registry, spawn_http_server, ControlMetrics, DaemonMetrics, SentinelMetrics,
    SharedRegistry,
};
use lw_sentinel::{LogNotifier, Sentinel, SentinelIngest, SnapshotCache};
use lw_store::{DailyPeaks, EventLogWriter};
use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "LoadWatch daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured initial operating mode")]
    mode: Option<CliMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Auto,
    Manual,
}

impl From<CliMode> for OperatingMode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Auto => OperatingMode::Auto,
            CliMode::Manual => OperatingMode::Manual,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the meter node and the watchdog")]
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/loadwatch.toml"));
    candidates.push(PathBuf::from("configs/example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    let load_duration = load_started.elapsed();

    if let Some(mode) = cli.mode {
        config.control.initial_mode = mode.into();
    }

    init_tracing("lwd", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(&registry)?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), build_profile());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, registry).await,
    }
}

async fn run_daemon(config: AppConfig, registry: SharedRegistry) -> Result<()> {
    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(registry.clone(), config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let broker = Broker::new(&config.bus);
    broker.attach_metrics(BusMetrics::register(&registry)?);

    // Offset calibration runs before anything is powered; the node inherits
    // the same source so the offsets stay valid.
    let mut source: Box<dyn AdcSource> = Box::new(SyntheticMains::new(&config.acquisition)?);
    let calibration = Calibration::measure(source.as_mut(), &config.acquisition);

    let control_metrics = ControlMetrics::new(&registry)?;
    let sentinel_metrics = SentinelMetrics::new(&registry)?;

    let node = MeterNode::new(
        config.clone(),
        &broker,
        source,
        calibration,
        Some(control_metrics),
    );

    let cache = Arc::new(SnapshotCache::new(config.sentinel.cache_ttl));
    let peaks = Arc::new(DailyPeaks::new(config.sentinel.peak_reset_utc_offset_hours));
    let event_log_path = config.store.directory.join("events.jsonl");
    let event_log = Arc::new(Mutex::new(EventLogWriter::open(&event_log_path)?));
    info!(path = %event_log_path.display(), "event log open");

    let notifier = Arc::new(LogNotifier);
    let ingest = SentinelIngest::new(
        &broker,
        cache.clone(),
        peaks.clone(),
        event_log.clone(),
        notifier.clone(),
    );
    let sentinel = Sentinel::new(
        config.sentinel.clone(),
        &broker,
        cache,
        peaks,
        event_log,
        notifier,
        Some(sentinel_metrics),
    );

    let (shutdown_tx, _) = broadcast::channel(8);
    let node_task = tokio::spawn(node.run(shutdown_tx.subscribe()));
    let ingest_task = tokio::spawn(ingest.run(shutdown_tx.subscribe()));
    let sentinel_task = tokio::spawn(sentinel.run(shutdown_tx.subscribe()));

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    let _ = shutdown_tx.send(());

    for (name, task) in [
        ("meter-node", node_task),
        ("sentinel-ingest", ingest_task),
        ("sentinel", sentinel_task),
    ] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(task = name, %error, "task ended with error"),
            Err(error) => warn!(task = name, %error, "task panicked"),
        }
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    info!("daemon stopped");
    Ok(())
}

fn build_profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}
