//! `/sessions` handlers (§6.2): session lifecycle and per-stage generation
//! listing, backed directly by the store rather than the Iteration
//! Controller, which only owns stage-transition semantics.
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    app::AppState,
    model::{Job, Session, SessionStage},
    util::error::OrchestratorError,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct CreateSessionRequest {
    flow_kind: String,
    #[serde(default)]
    initial_config: serde_json::Map<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct SessionResponse {
    id: Uuid,
    flow_kind: String,
    stage: SessionStage,
    stage_index: u32,
    created_at: chrono::DateTime<Utc>,
}

impl From<&Session> for SessionResponse {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            flow_kind: session.flow_kind.clone(),
            stage: session.stage,
            stage_index: session.current_stage_index,
            created_at: session.created_at,
        }
    }
}

pub(crate) async fn create(
    State(state): State<AppState>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), OrchestratorError> {
    let now = Utc::now();
    let session = Session {
        id: Uuid::new_v4(),
        flow_kind: payload.flow_kind,
        current_stage_index: 0,
        stage: SessionStage::Configuring,
        config: payload.initial_config,
        created_at: now,
        updated_at: now,
    };
    state.store().put_session(&session).await?;
    Ok((StatusCode::CREATED, Json(SessionResponse::from(&session))))
}

pub(crate) async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, OrchestratorError> {
    let session = state.store().get_session(id).await?;
    Ok(Json(SessionResponse::from(&session)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct GenerationsQuery {
    stage: Option<u32>,
}

pub(crate) async fn generations(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<GenerationsQuery>,
) -> Result<Json<Vec<Job>>, OrchestratorError> {
    let jobs = state.store().list_jobs_by_session(id, query.stage).await?;
    Ok(Json(jobs))
}

pub(crate) async fn delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, OrchestratorError> {
    state.executor().cancel_session(id).await;
    state.store().delete_session(id).await?;
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
    async fn create_then_get_round_trips() {
        let state = test_state().await;
        let app = crate::api::router(state);

        let create_request = Request::post("/sessions")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&serde_json::json!({ "flow-kind": "standard" })).unwrap(),
            ))
            .unwrap();
        let response = app.clone().oneshot(create_request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let created: SessionResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(created.flow_kind, "standard");
        assert_eq!(created.stage, SessionStage::Configuring);

        let get_request = Request::get(format!("/sessions/{}", created.id))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(get_request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_missing_session_is_not_found() {
        let state = test_state().await;
        let app = crate::api::router(state);
        let request = Request::get(format!("/sessions/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
