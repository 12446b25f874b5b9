//! Live Prometheus metrics of a running load test.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use dbload_engine::{OperationRecord, RecordObserver};
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TEXT_FORMAT, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Publishes operation latencies, operation counts and open connections.
///
/// Registered as a [`RecordObserver`] and served in the Prometheus text format at `/metrics`.
pub struct PrometheusExporter {
    registry: Registry,
    latency: HistogramVec,
    operations: IntCounterVec,
    connections: IntGauge,
}

impl fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusExporter")
            .field("connections", &self.connections.get())
            .finish_non_exhaustive()
    }
}

impl PrometheusExporter {
    /// Registers all metrics. `buckets` are the latency histogram bounds in seconds.
    pub fn new(buckets: Vec<f64>) -> Result<Self> {
        let registry = Registry::new();

        let opts = HistogramOpts::new("operation_latency_seconds", "Operation latency in seconds")
            .buckets(buckets);
        // Children are created lazily on first use, so check the buckets now.
        Histogram::with_opts(opts.clone()).context("invalid latency buckets")?;
        let latency = HistogramVec::new(opts, &["operation_type"])?;
        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Total number of operations"),
            &["operation_type", "status"],
        )?;
        let connections = IntGauge::new(
            "active_connections",
            "Number of active database connections",
        )?;

        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(connections.clone()))?;

        Ok(Self {
            registry,
            latency,
            operations,
            connections,
        })
    }

    /// Renders all metrics in the text exposition format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Serves `/metrics` on `listener` until `shutdown` is cancelled.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let app = Router::new()
            .route("/metrics", get(scrape))
            .with_state(self);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .context("metrics endpoint failed")
    }
}

async fn scrape(State(exporter): State<Arc<PrometheusExporter>>) -> Response {
    match exporter.encode() {
        Ok(body) => ([(CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            tracing::error!("failed to encode metrics: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

impl RecordObserver for PrometheusExporter {
    fn observe(&self, record: &OperationRecord) {
        let kind = record.kind.as_str();
        let status = if record.outcome.is_success() {
            "success"
        } else {
            "error"
        };

        self.latency
            .with_label_values(&[kind])
            .observe(record.latency.as_secs_f64());
        self.operations.with_label_values(&[kind, status]).inc();
    }

    fn connections(&self, active: usize) {
        self.connections.set(active as i64);
    }
}
