//! `/preferences` handlers (§6.2, §4.8): digestible stats, model
//! recommendation, and the export/import round trip used for backing up or
//! migrating the Preference Engine's state.
use std::collections::BTreeSet;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{app::AppState, preference::PreferenceExport, util::error::OrchestratorError};

pub(crate) async fn stats(State(state): State<AppState>) -> Json<crate::preference::PreferenceStatsSummary> {
    Json(state.preference().stats_summary().await)
}

#[derive(Debug, Deserialize)]
pub(crate) struct RecommendQuery {
    prompt: String,
    #[serde(default)]
    candidates: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ModelRecommendationResponse {
    model: String,
    confidence: f64,
}

pub(crate) async fn recommend_model(
    State(state): State<AppState>,
    Query(query): Query<RecommendQuery>,
) -> Result<Json<ModelRecommendationResponse>, OrchestratorError> {
    let candidates = candidate_list(&state, query.candidates.as_deref()).await;
    let recommendation = state.preference().recommend_model(&query.prompt, &candidates).await?;
    state.telemetry().record_recommendation_served();
    Ok(Json(ModelRecommendationResponse {
        model: recommendation.model,
        confidence: recommendation.confidence,
    }))
}

async fn candidate_list(state: &AppState, explicit: Option<&str>) -> Vec<String> {
    if let Some(raw) = explicit {
        return raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    let tags: BTreeSet<String> = state
        .registry()
        .snapshot()
        .await
        .into_iter()
        .flat_map(|node| node.capabilities.into_iter())
        .collect();
    tags.into_iter().collect()
}

pub(crate) async fn export(State(state): State<AppState>) -> Json<PreferenceExport> {
    Json(state.preference().export().await)
}

pub(crate) async fn import(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, OrchestratorError> {
    let raw = String::from_utf8_lossy(&body);
    state.preference().import(&raw).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::app::test_support::test_state;

    #[tokio::test]
    async fn stats_starts_at_zero() {
        let state = test_state().await;
        let app = crate::api::router(state);
        let request = Request::get("/preferences/stats").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let summary: crate::preference::PreferenceStatsSummary = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary.total_events, 0);
    }

    #[tokio::test]
    async fn export_import_round_trip_via_http() {
        let state = test_state().await;
        let app = crate::api::router(state);

        let export_request = Request::get("/preferences/export").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(export_request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();

        let import_request = Request::post("/preferences/import")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(import_request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
