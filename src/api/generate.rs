//! `/generate` handlers (§6.2): single-image and batch submission, plus
//! generation status lookup.
use axum::{extract::{Path, State}, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{
    app::AppState,
    executor::{BatchGenerateRequest, GenerateRequest},
    model::{Job, JobState, ParameterBundle, TaskClass},
    util::error::OrchestratorError,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct GenerateBody {
    session_id: Uuid,
    #[serde(default)]
    stage: u32,
    task_class: TaskClass,
    prompt: String,
    #[serde(default)]
    negative_prompt: String,
    model_family: String,
    #[serde(flatten)]
    params: ParameterBundle,
    #[serde(default)]
    preferred_node_id: Option<String>,
    #[serde(default)]
    template_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct GenerateResponse {
    id: Uuid,
    status: JobState,
    node_id: Option<String>,
}

pub(crate) async fn generate(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> Result<(StatusCode, Json<GenerateResponse>), OrchestratorError> {
    let job_id = state
        .executor()
        .submit_single(GenerateRequest {
            session_id: body.session_id,
            stage: body.stage,
            task_class: body.task_class,
            prompt: body.prompt,
            negative_prompt: body.negative_prompt,
            model_family: body.model_family,
            params: body.params,
            preferred_node_id: body.preferred_node_id,
            template_name: body.template_name,
        })
        .await?;
    state.telemetry().record_job_dispatched();

    let job = state.store().get_job(job_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateResponse {
            id: job.id,
            status: job.state,
            node_id: job.node_id,
        }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct BatchGenerateBody {
    session_id: Uuid,
    #[serde(default)]
    stage: u32,
    task_class: TaskClass,
    count: u32,
    prompt: String,
    #[serde(default)]
    negative_prompt: String,
    #[serde(default)]
    explore_models: Vec<String>,
    #[serde(default)]
    candidate_adapters: Vec<String>,
    #[serde(default)]
    auto_adapters: bool,
    #[serde(flatten)]
    base_params: ParameterBundle,
    seed_start: i64,
    #[serde(default)]
    template_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct BatchGenerateResponse {
    batch_id: Uuid,
    total_count: u32,
    allocation: BTreeMap<String, u32>,
}

pub(crate) async fn generate_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchGenerateBody>,
) -> Result<(StatusCode, Json<BatchGenerateResponse>), OrchestratorError> {
    let batch_id = state
        .executor()
        .submit_batch(BatchGenerateRequest {
            session_id: body.session_id,
            stage: body.stage,
            task_class: body.task_class,
            count: body.count,
            prompt: body.prompt,
            negative_prompt: body.negative_prompt,
            candidate_models: body.explore_models,
            candidate_adapters: body.candidate_adapters,
            auto_adapters: body.auto_adapters,
            base_params: body.base_params,
            seed_start: body.seed_start,
            template_name: body.template_name,
        })
        .await?;

    let batch = state.store().get_batch(batch_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(BatchGenerateResponse {
            batch_id: batch.id,
            total_count: batch.total,
            allocation: batch.allocation.into_iter().collect(),
        }),
    ))
}

pub(crate) async fn get_generation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, OrchestratorError> {
    let job = state.store().get_job(id).await?;
    Ok(Json(job))
}
