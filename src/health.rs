//! Health Prober (§4.2): periodically pings every node and updates the
//! Registry with healthy/unhealthy and round-trip latency.
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::{observability::Telemetry, registry::Registry};

#[derive(Debug, Clone)]
pub struct HealthProber {
    http: reqwest::Client,
    registry: Registry,
    interval: Duration,
    probe_timeout: Duration,
    telemetry: Option<Telemetry>,
}

impl HealthProber {
    #[must_use]
    pub fn new(registry: Registry, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            registry,
            interval,
            probe_timeout,
            telemetry: None,
        }
    }

    /// Attaches a telemetry handle so each probe sweep's wall-clock duration
    /// is recorded into the health-probe-duration histogram.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Runs one probe tick against every node currently in the inventory.
    /// The prober never retries within a tick: a transient failure downgrades
    /// the node until the next tick.
    pub async fn probe_once(&self) {
        let sweep_started = Instant::now();
        let nodes = self.registry.snapshot().await;
        let futures = nodes.into_iter().map(|node| {
            let http = self.http.clone();
            let registry = self.registry.clone();
            let timeout = self.probe_timeout;
            async move {
                let url = format!("{}/system_stats", node.base_url());
                let started = Instant::now();
                let result = tokio::time::timeout(timeout, http.get(&url).send()).await;
                match result {
                    Ok(Ok(response)) if response.status().is_success() => {
                        let latency = started.elapsed().as_millis() as u64;
                        registry.update_health(&node.id, true, Some(latency)).await;
                    }
                    _ => {
                        tracing::warn!(node_id = %node.id, "health probe failed or timed out");
                        registry.update_health(&node.id, false, None).await;
                    }
                }
            }
        });
        futures::future::join_all(futures).await;

        if let Some(telemetry) = &self.telemetry {
            telemetry.record_probe_duration(sweep_started.elapsed().as_secs_f64());
        }
    }

    /// Spawns the fixed-interval probing loop as a background task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.probe_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeDecl, NodeInventoryFile};
    use crate::model::Tier;
    use std::collections::BTreeSet;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn successful_probe_marks_node_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/system_stats"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let uri = server.uri();
        let parsed: url::Url = uri.parse().unwrap();

        let registry = Registry::new();
        registry
            .load(NodeInventoryFile {
                nodes: vec![NodeDecl {
                    id: "n1".into(),
                    display_name: "Node 1".into(),
                    tier: Tier::Draft,
                    vram_gb: 24,
                    host: parsed.host_str().unwrap().into(),
                    port: parsed.port().unwrap(),
                    capabilities: BTreeSet::from(["sd15".to_string()]),
                    max_resolution: 1024,
                    max_batch: 8,
                    max_concurrent_jobs: 4,
                }],
            })
            .await
            .unwrap();

        let prober = HealthProber::new(
            registry.clone(),
            Duration::from_secs(10),
            Duration::from_secs(3),
        );
        prober.probe_once().await;

        let node = registry.get("n1").await.unwrap();
        assert!(node.runtime.healthy);
        assert!(node.runtime.last_latency_ms.is_some());
    }

    #[tokio::test]
    async fn unreachable_node_marked_unhealthy() {
        let registry = Registry::new();
        registry
            .load(NodeInventoryFile {
                nodes: vec![NodeDecl {
                    id: "n1".into(),
                    display_name: "Node 1".into(),
                    tier: Tier::Draft,
                    vram_gb: 24,
                    host: "127.0.0.1".into(),
                    port: 1, // nothing listens here
                    capabilities: BTreeSet::from(["sd15".to_string()]),
                    max_resolution: 1024,
                    max_batch: 8,
                    max_concurrent_jobs: 4,
                }],
            })
            .await
            .unwrap();

        let prober = HealthProber::new(
            registry.clone(),
            Duration::from_secs(10),
            Duration::from_millis(200),
        );
        prober.probe_once().await;

        let node = registry.get("n1").await.unwrap();
        assert!(!node.runtime.healthy);
    }
}
