//! `/dashboard` handlers: a fleet-wide overview and per-session job listing
//! for an operator console, supplementing spec §6.2's core surface.
use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{app::AppState, model::Job, util::error::OrchestratorError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct OverviewResponse {
    nodes_healthy: usize,
    nodes_total: usize,
    queue_depth_total: i64,
    preference_events_recorded: usize,
}

pub(crate) async fn overview(State(state): State<AppState>) -> Json<OverviewResponse> {
    let nodes = state.registry().snapshot().await;
    let nodes_total = nodes.len();
    let nodes_healthy = nodes.iter().filter(|n| n.runtime.healthy).count();
    let queue_depth_total: i64 = nodes.iter().map(|n| n.runtime.queue_depth).sum();
    state.telemetry().record_queue_depth(queue_depth_total);

    let stats = state.preference().stats_summary().await;
    Json(OverviewResponse {
        nodes_healthy,
        nodes_total,
        queue_depth_total,
        preference_events_recorded: stats.total_events,
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct JobsQuery {
    session_id: Uuid,
    #[serde(default)]
    stage: Option<u32>,
}

pub(crate) async fn jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Vec<Job>>, OrchestratorError> {
    let jobs = state.store().list_jobs_by_session(query.session_id, query.stage).await?;
    Ok(Json(jobs))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::app::test_support::test_state;

    #[tokio::test]
    async fn overview_with_empty_fleet_reports_zero() {
        let state = test_state().await;
        let app = crate::api::router(state);
        let request = Request::get("/dashboard/overview").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
