//! `/nodes` and `/health` handlers (§6.2): inventory snapshot and aggregate
//! fleet health, the latter also recorded into the node-health gauges.
use axum::{extract::State, Json};
use serde::Serialize;

use crate::{app::AppState, model::Node};

pub(crate) async fn list(State(state): State<AppState>) -> Json<Vec<Node>> {
    Json(state.registry().snapshot().await)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct HealthReport {
    status: &'static str,
    nodes_healthy: usize,
    nodes_total: usize,
}

pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let nodes = state.registry().snapshot().await;
    let nodes_total = nodes.len();
    let nodes_healthy = nodes.iter().filter(|n| n.runtime.healthy).count();
    state.telemetry().record_node_health(nodes_healthy as u64, nodes_total as u64);

    let status = if nodes_total == 0 {
        "unknown"
    } else if nodes_healthy == nodes_total {
        "healthy"
    } else if nodes_healthy == 0 {
        "unhealthy"
    } else {
        "degraded"
    };

    Json(HealthReport {
        status,
        nodes_healthy,
        nodes_total,
    })
}
