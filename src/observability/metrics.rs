use prometheus::{
    Counter, Gauge, Histogram, Registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_with_registry,
};
use std::sync::Arc;

/// Prometheus instruments for the orchestrator.
#[derive(Debug, Clone)]
pub struct Metrics {
    pub nodes_total: Gauge,
    pub nodes_healthy: Gauge,
    pub queue_depth_total: Gauge,
    pub jobs_dispatched: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub batches_completed: Counter,
    pub worker_reconnects: Counter,
    pub recommendations_served: Counter,

    pub job_duration: Histogram,
    pub probe_duration: Histogram,
}

impl Metrics {
    /// Registers every orchestrator instrument against `registry`.
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            nodes_total: register_gauge_with_registry!(
                "orchestrator_nodes_total",
                "Total nodes in the inventory",
                registry
            )?,
            nodes_healthy: register_gauge_with_registry!(
                "orchestrator_nodes_healthy",
                "Nodes currently reporting healthy",
                registry
            )?,
            queue_depth_total: register_gauge_with_registry!(
                "orchestrator_queue_depth_total",
                "Sum of in-flight queue depth across all nodes",
                registry
            )?,
            jobs_dispatched: register_counter_with_registry!(
                "orchestrator_jobs_dispatched_total",
                "Jobs dispatched to a worker node",
                registry
            )?,
            jobs_completed: register_counter_with_registry!(
                "orchestrator_jobs_completed_total",
                "Jobs that reached the complete state",
                registry
            )?,
            jobs_failed: register_counter_with_registry!(
                "orchestrator_jobs_failed_total",
                "Jobs that reached the failed state",
                registry
            )?,
            batches_completed: register_counter_with_registry!(
                "orchestrator_batches_completed_total",
                "Batches whose jobs all reached a terminal state",
                registry
            )?,
            worker_reconnects: register_counter_with_registry!(
                "orchestrator_worker_ws_reconnects_total",
                "Outbound worker event-stream reconnect attempts",
                registry
            )?,
            recommendations_served: register_counter_with_registry!(
                "orchestrator_preference_recommendations_total",
                "Preference Engine recommendations served",
                registry
            )?,
            job_duration: register_histogram_with_registry!(
                "orchestrator_job_duration_seconds",
                "Wall-clock duration of a job from dispatch to terminal state",
                registry
            )?,
            probe_duration: register_histogram_with_registry!(
                "orchestrator_health_probe_duration_seconds",
                "Duration of a single health-probe sweep across all nodes",
                registry
            )?,
        })
    }
}
