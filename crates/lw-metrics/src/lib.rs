//! ---
//! lw_section: "08-observability"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Prometheus registry, scrape endpoint and metric families."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use lw_common::{Issuer, Severity};

/// Shared registry handed to every component that exports metrics.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .context("failed to read bound metrics address")?;
    let listener = TcpListener::from_std(std_listener)
        .context("failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound listen address, useful when configured with port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    /// Register the daemon families against `registry`.
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "lwd_starts_total",
            "Total number of times the LoadWatch daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "lwd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "lwd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    /// Count one daemon initialisation.
    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    /// Record how long configuration loading took.
    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    /// Pin build metadata onto the registry.
    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info.with_label_values(&[version, profile]).set(1.0);
    }
}

/// Metrics exported by the relay control loop.
#[derive(Clone, Debug)]
pub struct ControlMetrics {
    ticks_total: IntCounter,
    relay_transitions_total: IntCounterVec,
    safety_trips_total: IntCounter,
}

impl ControlMetrics {
    /// Register the control-loop families against `registry`.
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let ticks_total = IntCounter::with_opts(Opts::new(
            "control_ticks_total",
            "Control loop ticks executed",
        ))?;
        registry.register(Box::new(ticks_total.clone()))?;

        let relay_transitions_total = IntCounterVec::new(
            Opts::new(
                "relay_transitions_total",
                "Applied relay transitions by issuer",
            ),
            &["issuer"],
        )?;
        registry.register(Box::new(relay_transitions_total.clone()))?;

        let safety_trips_total = IntCounter::with_opts(Opts::new(
            "safety_trips_total",
            "Firmware safety trips (relay forced off by a hard ceiling)",
        ))?;
        registry.register(Box::new(safety_trips_total.clone()))?;

        Ok(Self {
            ticks_total,
            relay_transitions_total,
            safety_trips_total,
        })
    }

    /// Count one control tick.
    pub fn record_tick(&self) {
        self.ticks_total.inc();
    }

    /// Count one applied relay transition.
    pub fn record_transition(&self, issuer: Issuer) {
        self.relay_transitions_total
            .with_label_values(&[issuer.as_str()])
            .inc();
    }

    /// Count one firmware safety trip.
    pub fn record_safety_trip(&self) {
        self.safety_trips_total.inc();
    }
}

/// Metrics exported by the anomaly detector.
#[derive(Clone, Debug)]
pub struct SentinelMetrics {
    evaluations_total: IntCounter,
    anomalies_total: IntCounterVec,
}

impl SentinelMetrics {
    /// Register the detector families against `registry`.
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let evaluations_total = IntCounter::with_opts(Opts::new(
            "sentinel_evaluations_total",
            "Detector evaluation passes executed",
        ))?;
        registry.register(Box::new(evaluations_total.clone()))?;

        let anomalies_total = IntCounterVec::new(
            Opts::new("anomalies_total", "Anomaly events raised by severity"),
            &["severity"],
        )?;
        registry.register(Box::new(anomalies_total.clone()))?;

        Ok(Self {
            evaluations_total,
            anomalies_total,
        })
    }

    /// Count one evaluation pass.
    pub fn record_evaluation(&self) {
        self.evaluations_total.inc();
    }

    /// Count one raised anomaly.
    pub fn record_anomaly(&self, severity: Severity) {
        self.anomalies_total
            .with_label_values(&[severity.as_str()])
            .inc();
    }
}

pub use prometheus;
