//! Canonical source of truth for node inventory and runtime health (§4.1).
use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use crate::{
    config::{NodeInventoryFile, validate_inventory},
    model::Node,
    util::error::OrchestratorError,
};

#[derive(Debug, Default)]
struct RegistryState {
    nodes: HashMap<String, Node>,
}

/// Readers may be many; the Health Prober and Job Executor are the only
/// writers. `tokio::sync::RwLock` gives readers a consistent view across all
/// fields of one node for the lifetime of their read guard.
#[derive(Debug, Clone)]
pub struct Registry {
    state: Arc<RwLock<RegistryState>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
        }
    }

    /// Replaces the inventory atomically from a parsed YAML file.
    pub async fn load(&self, file: NodeInventoryFile) -> Result<(), crate::config::ConfigError> {
        let nodes = validate_inventory(file)?;
        let mut guard = self.state.write().await;
        guard.nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        Ok(())
    }

    /// Re-reads the YAML inventory file at `path` and calls `load`.
    pub async fn reload(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let raw = tokio::fs::read_to_string(path).await?;
        let file: NodeInventoryFile = serde_yaml::from_str(&raw)?;
        self.load(file).await?;
        Ok(())
    }

    pub async fn get(&self, node_id: &str) -> Result<Node, OrchestratorError> {
        let guard = self.state.read().await;
        guard
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("node {node_id}")))
    }

    /// Returns the subset of nodes whose capability set contains `tag`.
    pub async fn capable(&self, tag: &str) -> Vec<Node> {
        let guard = self.state.read().await;
        guard
            .nodes
            .values()
            .filter(|n| n.is_capable(tag))
            .cloned()
            .collect()
    }

    /// An immutable copy of all nodes and their runtime state.
    pub async fn snapshot(&self) -> Vec<Node> {
        let guard = self.state.read().await;
        guard.nodes.values().cloned().collect()
    }

    /// Called by the Health Prober; atomic with respect to `snapshot`.
    pub async fn update_health(&self, node_id: &str, healthy: bool, latency_ms: Option<u64>) {
        let mut guard = self.state.write().await;
        if let Some(node) = guard.nodes.get_mut(node_id) {
            if node.runtime.healthy != healthy {
                node.runtime.transition_count += 1;
                tracing::info!(node_id, healthy, "node health transition");
            }
            node.runtime.healthy = healthy;
            node.runtime.last_latency_ms = latency_ms;
        }
    }

    /// Called by the Job Executor; `delta` is `+1` on dispatch, `-1` on
    /// terminal completion/failure.
    pub async fn bump_queue(&self, node_id: &str, delta: i64) {
        let mut guard = self.state.write().await;
        if let Some(node) = guard.nodes.get_mut(node_id) {
            node.runtime.queue_depth += delta;
        }
    }
}
