//! Fire-and-forget metrics observer.
//!
//! The server core reports through [`MetricsObserver`]; nothing in the core
//! reads metrics back. [`PrometheusMetrics`] records into a Prometheus
//! [`Registry`] and [`serve`] exposes it as `GET /metrics`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::warn;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Upper bounds (seconds) for action processing latency.
pub const ACTION_BUCKETS: [f64; 5] = [0.1, 0.5, 1.0, 2.0, 5.0];

/// Upper bounds (seconds) for store round-trip latency.
pub const STORE_BUCKETS: [f64; 5] = [0.01, 0.05, 0.1, 0.5, 1.0];

/// Side-channel observer. Every method has a no-op default.
pub trait MetricsObserver: Send + Sync {
    fn connection_opened(&self) {}
    fn connection_closed(&self) {}
    fn draw_committed(&self) {}
    fn clear_committed(&self) {}
    /// Time from frame decode to commit + publish.
    fn action_processed(&self, _elapsed: Duration) {}
    /// One store call, successful or not.
    fn store_round_trip(&self, _elapsed: Duration) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsObserver for NoopMetrics {}

/// Whiteboard counters and histograms registered on their own [`Registry`].
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    connections_total: IntCounter,
    connections_active: IntGauge,
    draw_actions: IntCounter,
    clear_actions: IntCounter,
    action_latency: Histogram,
    store_latency: Histogram,
}

impl PrometheusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "whiteboard_connections_total",
            "Total number of client connections",
        )?;
        let connections_active = IntGauge::new(
            "whiteboard_connections_active",
            "Client connections currently open",
        )?;
        let draw_actions = IntCounter::new(
            "whiteboard_draw_actions_total",
            "Total number of drawing actions",
        )?;
        let clear_actions = IntCounter::new(
            "whiteboard_clear_actions_total",
            "Total number of canvas clears",
        )?;
        let action_latency = Histogram::with_opts(
            HistogramOpts::new(
                "whiteboard_action_processing_seconds",
                "Time spent processing drawing actions",
            )
            .buckets(ACTION_BUCKETS.to_vec()),
        )?;
        let store_latency = Histogram::with_opts(
            HistogramOpts::new(
                "whiteboard_store_operation_seconds",
                "Time spent on store operations",
            )
            .buckets(STORE_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(draw_actions.clone()))?;
        registry.register(Box::new(clear_actions.clone()))?;
        registry.register(Box::new(action_latency.clone()))?;
        registry.register(Box::new(store_latency.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            draw_actions,
            clear_actions,
            action_latency,
            store_latency,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.get(),
            connections_active: self.connections_active.get(),
            draw_actions: self.draw_actions.get(),
            clear_actions: self.clear_actions.get(),
            action_latency: HistogramSnapshot::of(&self.action_latency),
            store_latency: HistogramSnapshot::of(&self.store_latency),
        }
    }
}

impl MetricsObserver for PrometheusMetrics {
    fn connection_opened(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    fn connection_closed(&self) {
        self.connections_active.dec();
    }

    fn draw_committed(&self) {
        self.draw_actions.inc();
    }

    fn clear_committed(&self) {
        self.clear_actions.inc();
    }

    fn action_processed(&self, elapsed: Duration) {
        self.action_latency.observe(elapsed.as_secs_f64());
    }

    fn store_round_trip(&self, elapsed: Duration) {
        self.store_latency.observe(elapsed.as_secs_f64());
    }
}

/// Count and sum of one histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: Duration,
}

impl HistogramSnapshot {
    fn of(histogram: &Histogram) -> Self {
        Self {
            count: histogram.get_sample_count(),
            sum: Duration::from_secs_f64(histogram.get_sample_sum().max(0.0)),
        }
    }

    pub fn total(&self) -> u64 {
        self.count
    }
}

/// Readable copy of [`PrometheusMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: i64,
    pub draw_actions: u64,
    pub clear_actions: u64,
    pub action_latency: HistogramSnapshot,
    pub store_latency: HistogramSnapshot,
}

/// Serve `GET /metrics` on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<PrometheusMetrics>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = Router::new()
        .route("/metrics", get(scrape))
        .with_state(metrics);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn scrape(State(metrics): State<Arc<PrometheusMetrics>>) -> Response {
    match metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
