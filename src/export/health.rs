use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::protocol::MetricKind;
use crate::store::Store;

/// Prometheus metrics describing the daemon itself.
///
/// All metrics use the "tallyd" namespace. The registry always exists so
/// call sites never branch; the HTTP server only runs when started.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Datagrams received on the UDP listener.
    pub packets_received: Counter,
    /// Malformed or conflicting field groups.
    pub bad_lines: Counter,
    /// Completed flush cycles.
    pub flushes: Counter,
    /// Flush cycle duration (snapshot, derive, publish, reset).
    pub flush_duration: Histogram,
    /// Accepted console connections.
    pub console_connections: Counter,
    /// Console commands by command name.
    pub console_commands: CounterVec,
    /// Backend flush errors by backend name.
    pub backend_errors: CounterVec,
    /// Failed UDP receives.
    pub udp_receive_errors: Counter,
    /// Keys held per bucket type, sampled after every flush.
    pub buckets: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let packets_received = Counter::with_opts(
            Opts::new(
                "packets_received_total",
                "Total datagrams received on the metrics listener.",
            )
            .namespace("tallyd"),
        )?;
        let bad_lines = Counter::with_opts(
            Opts::new(
                "bad_lines_total",
                "Total malformed or type-conflicting field groups.",
            )
            .namespace("tallyd"),
        )?;
        let flushes = Counter::with_opts(
            Opts::new("flushes_total", "Total completed flush cycles.").namespace("tallyd"),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Flush cycle duration including backend dispatch.",
            )
            .namespace("tallyd")
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let console_connections = Counter::with_opts(
            Opts::new(
                "console_connections_total",
                "Total accepted management console connections.",
            )
            .namespace("tallyd"),
        )?;
        let console_commands = CounterVec::new(
            Opts::new(
                "console_commands_total",
                "Total management console commands by command.",
            )
            .namespace("tallyd"),
            &["command"],
        )?;
        let backend_errors = CounterVec::new(
            Opts::new(
                "backend_errors_total",
                "Total backend flush errors by backend.",
            )
            .namespace("tallyd"),
            &["backend"],
        )?;
        let udp_receive_errors = Counter::with_opts(
            Opts::new(
                "udp_receive_errors_total",
                "Total failed receives on the metrics listener.",
            )
            .namespace("tallyd"),
        )?;
        let buckets = GaugeVec::new(
            Opts::new("buckets", "Number of keys held per bucket type.").namespace("tallyd"),
            &["type"],
        )?;

        registry.register(Box::new(packets_received.clone()))?;
        registry.register(Box::new(bad_lines.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(console_connections.clone()))?;
        registry.register(Box::new(console_commands.clone()))?;
        registry.register(Box::new(backend_errors.clone()))?;
        registry.register(Box::new(udp_receive_errors.clone()))?;
        registry.register(Box::new(buckets.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            packets_received,
            bad_lines,
            flushes,
            flush_duration,
            console_connections,
            console_commands,
            backend_errors,
            udp_receive_errors,
            buckets,
        })
    }

    /// Updates the per-type key gauges from the store.
    pub fn observe_buckets(&self, store: &Store) {
        for (kind, count) in store.bucket_counts() {
            self.buckets
                .with_label_values(&[kind_label(kind)])
                .set(count as f64);
        }
    }

    /// Renders the registry in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9103"
        } else {
            self.addr.as_str()
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Whether the HTTP server has been started and not stopped.
    pub fn is_serving(&self) -> bool {
        self.shutdown.lock().is_some()
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

fn kind_label(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Counter => "counters",
        MetricKind::Timer => "timers",
        MetricKind::Gauge => "gauges",
        MetricKind::Set => "sets",
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
