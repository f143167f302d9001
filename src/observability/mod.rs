pub(crate) mod metrics;
pub(crate) mod tracing;

use std::sync::Arc;

use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};

use self::metrics::Metrics;

/// Bundles the Prometheus registry and tracing init behind one handle so
/// `ComponentRegistry` only has to carry a single telemetry field.
#[derive(Debug, Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// Initializes tracing and registers the metric set. Call once at
    /// startup.
    pub fn new() -> Result<Self> {
        tracing::init()?;
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new(Arc::clone(&registry))?);
        Ok(Self { registry, metrics })
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn record_job_dispatched(&self) {
        self.metrics.jobs_dispatched.inc();
    }

    pub fn record_job_completed(&self) {
        self.metrics.jobs_completed.inc();
    }

    pub fn record_job_failed(&self) {
        self.metrics.jobs_failed.inc();
        ::tracing::warn!("job reached failed state");
    }

    pub fn record_batch_completed(&self) {
        self.metrics.batches_completed.inc();
    }

    pub fn record_worker_reconnect(&self, node_id: &str) {
        self.metrics.worker_reconnects.inc();
        ::tracing::warn!(node_id, "worker event-stream reconnect");
    }

    pub fn record_recommendation_served(&self) {
        self.metrics.recommendations_served.inc();
    }

    pub fn record_node_health(&self, healthy: u64, total: u64) {
        self.metrics.nodes_healthy.set(healthy as f64);
        self.metrics.nodes_total.set(total as f64);
    }

    pub fn record_queue_depth(&self, total: i64) {
        self.metrics.queue_depth_total.set(total as f64);
    }

    pub fn record_job_duration(&self, seconds: f64) {
        self.metrics.job_duration.observe(seconds);
    }

    pub fn record_probe_duration(&self, seconds: f64) {
        self.metrics.probe_duration.observe(seconds);
    }

    /// Renders every registered metric in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        String::from_utf8(buffer).unwrap_or_default()
    }
}
