//! `/iterate` handlers (§6.2, §4.9): feedback ingestion for a reviewing
//! stage, deferring stage-transition and preference-recording semantics to
//! the Iteration Controller.
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{app::AppState, model::Job, util::error::OrchestratorError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct IterateBody {
    session_id: Uuid,
    #[serde(default)]
    selected_ids: Vec<Uuid>,
    #[serde(default)]
    rejected_ids: Vec<Uuid>,
    action: String,
    #[serde(default)]
    feedback_text: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    parameter_adjustments: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct IterateResponse {
    suggested_prompt: String,
    suggested_negative: String,
    parameters: Value,
    rationale: String,
}

pub(crate) async fn iterate(
    State(state): State<AppState>,
    Json(body): Json<IterateBody>,
) -> Result<Json<IterateResponse>, OrchestratorError> {
    let selected = fetch_jobs(&state, &body.selected_ids).await?;
    let rejected = fetch_jobs(&state, &body.rejected_ids).await?;

    if !rejected.is_empty() {
        state
            .iteration()
            .reject_all(body.session_id, &rejected, body.feedback_text.clone())
            .await?;
    }

    let (prompt, rationale) = if selected.is_empty() {
        (String::new(), "no generations selected".to_string())
    } else {
        state
            .iteration()
            .select(body.session_id, &selected, body.feedback_text.clone())
            .await?
    };

    if body.action == "select" {
        let _ = state.iteration().advance(body.session_id, state.config().total_stages()).await;
    }

    let negative = selected.first().map(|job| job.negative_prompt.clone()).unwrap_or_default();
    let parameters = selected
        .first()
        .map(|job| serde_json::to_value(&job.params).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);

    Ok(Json(IterateResponse {
        suggested_prompt: prompt,
        suggested_negative: negative,
        parameters,
        rationale,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RejectAllBody {
    session_id: Uuid,
    stage: u32,
    rejected_ids: Vec<Uuid>,
    #[serde(default)]
    feedback_text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RejectAllResponse {
    recorded: bool,
    rationale: String,
}

pub(crate) async fn reject_all(
    State(state): State<AppState>,
    Json(body): Json<RejectAllBody>,
) -> Result<Json<RejectAllResponse>, OrchestratorError> {
    let mut jobs = fetch_jobs(&state, &body.rejected_ids).await?;
    jobs.retain(|job| job.stage == body.stage);

    state
        .iteration()
        .reject_all(body.session_id, &jobs, body.feedback_text.clone())
        .await?;

    Ok(Json(RejectAllResponse {
        recorded: true,
        rationale: "all generations in this stage rejected".to_string(),
    }))
}

async fn fetch_jobs(state: &AppState, ids: &[Uuid]) -> Result<Vec<Job>, OrchestratorError> {
    let mut jobs = Vec::with_capacity(ids.len());
    for id in ids {
        jobs.push(state.store().get_job(*id).await?);
    }
    Ok(jobs)
}
