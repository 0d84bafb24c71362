use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "windowfold";

/// Prometheus metrics for aggregation health.
///
/// All metrics use the "windowfold" namespace. Per-stream metrics carry a
/// `stream` label (`summary`, `spend`, `freshness`).
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Scheduled and explicit runs by stream and outcome (ok/error/skipped).
    pub runs_total: CounterVec,
    /// Windows aggregated by stream.
    pub windows_processed: CounterVec,
    /// Summary or latest-value rows written by stream.
    pub rows_written: CounterVec,
    /// Raw records excluded for missing or malformed fields.
    pub records_skipped: CounterVec,
    /// Aggregation failures by stream and error type.
    pub aggregation_errors: CounterVec,
    /// Alerts raised by name and severity.
    pub alerts_raised: CounterVec,
    /// Backlog seconds dropped by the catch-up bound.
    pub catchup_skipped_seconds: Counter,
    /// Seconds between the last tick and the stream checkpoint.
    pub checkpoint_lag_seconds: GaugeVec,
    /// Run duration by stream.
    pub run_duration: HistogramVec,
    /// ClickHouse connection state (1=connected, 0=disconnected).
    pub clickhouse_connected: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let runs_total = CounterVec::new(
            Opts::new("runs_total", "Aggregation runs by stream and outcome.")
                .namespace(NAMESPACE),
            &["stream", "outcome"],
        )?;
        let windows_processed = CounterVec::new(
            Opts::new("windows_processed_total", "Windows aggregated by stream.")
                .namespace(NAMESPACE),
            &["stream"],
        )?;
        let rows_written = CounterVec::new(
            Opts::new("rows_written_total", "Rows written by stream.").namespace(NAMESPACE),
            &["stream"],
        )?;
        let records_skipped = CounterVec::new(
            Opts::new(
                "records_skipped_total",
                "Raw records excluded for missing or malformed fields.",
            )
            .namespace(NAMESPACE),
            &["stream"],
        )?;
        let aggregation_errors = CounterVec::new(
            Opts::new(
                "aggregation_errors_total",
                "Aggregation failures by stream and error type.",
            )
            .namespace(NAMESPACE),
            &["stream", "error_type"],
        )?;
        let alerts_raised = CounterVec::new(
            Opts::new("alerts_raised_total", "Alerts raised by name and severity.")
                .namespace(NAMESPACE),
            &["alert", "severity"],
        )?;
        let catchup_skipped_seconds = Counter::with_opts(
            Opts::new(
                "catchup_skipped_seconds_total",
                "Backlog seconds dropped by the catch-up bound.",
            )
            .namespace(NAMESPACE),
        )?;
        let checkpoint_lag_seconds = GaugeVec::new(
            Opts::new(
                "checkpoint_lag_seconds",
                "Seconds between the last tick and the stream checkpoint.",
            )
            .namespace(NAMESPACE),
            &["stream"],
        )?;
        let run_duration = HistogramVec::new(
            HistogramOpts::new("run_duration_seconds", "Aggregation run duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 120.0]),
            &["stream"],
        )?;
        let clickhouse_connected = Gauge::with_opts(
            Opts::new(
                "clickhouse_connected",
                "ClickHouse connection state (1=connected, 0=disconnected).",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(runs_total.clone()))?;
        registry.register(Box::new(windows_processed.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(records_skipped.clone()))?;
        registry.register(Box::new(aggregation_errors.clone()))?;
        registry.register(Box::new(alerts_raised.clone()))?;
        registry.register(Box::new(catchup_skipped_seconds.clone()))?;
        registry.register(Box::new(checkpoint_lag_seconds.clone()))?;
        registry.register(Box::new(run_duration.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            runs_total,
            windows_processed,
            rows_written,
            records_skipped,
            aggregation_errors,
            alerts_raised,
            catchup_skipped_seconds,
            checkpoint_lag_seconds,
            run_duration,
            clickhouse_connected,
        })
    }

    /// Records the outcome of one run.
    pub fn record_run(&self, stream: &str, outcome: &str, elapsed_secs: f64) {
        self.runs_total.with_label_values(&[stream, outcome]).inc();
        self.run_duration
            .with_label_values(&[stream])
            .observe(elapsed_secs);
    }

    /// Encodes every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

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

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
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
