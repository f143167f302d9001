//! Iteration Controller (§4.9): per-session stage funnel, feedback
//! ingestion, and next-batch planning. Pure with respect to side effects
//! apart from Preference Engine writes, session persistence, and the
//! external prompt-rewriting seam.
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::{
    executor::BatchGenerateRequest,
    model::{FeedbackAction, Job, Session, SessionStage},
    preference::PreferenceEngine,
    store::OrchestratorStore,
    util::error::OrchestratorError,
};

const DEFAULT_MORE_LIKE_THIS_DENOISE: f32 = 0.4;

/// The seam where an external, unspecified prompt-rewriting collaborator
/// would plug in. The default implementation passes the prompt through
/// unchanged.
pub trait PromptRewriter: Send + Sync {
    fn rewrite(&self, original_prompt: &str, selected_count: usize) -> (String, String);
}

#[derive(Debug, Default)]
pub struct NoopRewriter;

impl PromptRewriter for NoopRewriter {
    fn rewrite(&self, original_prompt: &str, _selected_count: usize) -> (String, String) {
        (original_prompt.to_string(), "no rewriter configured".to_string())
    }
}

#[derive(Clone)]
pub struct IterationController {
    preference: PreferenceEngine,
    store: Arc<dyn OrchestratorStore>,
    rewriter: Arc<dyn PromptRewriter>,
}

impl IterationController {
    #[must_use]
    pub fn new(preference: PreferenceEngine, store: Arc<dyn OrchestratorStore>, rewriter: Arc<dyn PromptRewriter>) -> Self {
        Self {
            preference,
            store,
            rewriter,
        }
    }

    /// `configuring -> generating` on submit.
    pub async fn begin_generating(&self, session_id: Uuid) -> Result<Session, OrchestratorError> {
        let mut session = self.store.get_session(session_id).await?;
        if session.stage != SessionStage::Configuring {
            return Err(OrchestratorError::RejectedByWorker(format!(
                "session {session_id} is not in the configuring stage"
            )));
        }
        session.stage = SessionStage::Generating;
        session.updated_at = Utc::now();
        self.store.put_session(&session).await?;
        Ok(session)
    }

    /// `generating -> reviewing` on batch-complete.
    pub async fn on_batch_complete(&self, session_id: Uuid) -> Result<Session, OrchestratorError> {
        let mut session = self.store.get_session(session_id).await?;
        if session.stage != SessionStage::Generating {
            return Err(OrchestratorError::RejectedByWorker(format!(
                "session {session_id} is not in the generating stage"
            )));
        }
        session.stage = SessionStage::Reviewing;
        session.updated_at = Utc::now();
        self.store.put_session(&session).await?;
        Ok(session)
    }

    /// Records selected generations as `action=selected`, then defers to the
    /// prompt-rewriting collaborator for the next stage's prompt.
    pub async fn select(
        &self,
        session_id: Uuid,
        selected: &[Job],
        feedback_text: Option<String>,
    ) -> Result<(String, String), OrchestratorError> {
        for job in selected {
            self.preference
                .record(
                    &job.prompt,
                    &job.model_family,
                    &adapter_ids(job),
                    FeedbackAction::Selected,
                    job.stage,
                    session_id,
                    feedback_text.clone(),
                )
                .await;
        }
        let prompt = selected.first().map(|job| job.prompt.clone()).unwrap_or_default();
        Ok(self.rewriter.rewrite(&prompt, selected.len()))
    }

    /// Records every generation in the current stage as `action=rejected`.
    /// Does not advance the stage; prior stage inputs remain available.
    pub async fn reject_all(
        &self,
        session_id: Uuid,
        generations: &[Job],
        feedback_text: Option<String>,
    ) -> Result<(), OrchestratorError> {
        for job in generations {
            self.preference
                .record(
                    &job.prompt,
                    &job.model_family,
                    &adapter_ids(job),
                    FeedbackAction::Rejected,
                    job.stage,
                    session_id,
                    feedback_text.clone(),
                )
                .await;
        }
        Ok(())
    }

    /// `reviewing -> generating` (with the next stage) or `reviewing ->
    /// done` if `total_stages` has been reached.
    pub async fn advance(&self, session_id: Uuid, total_stages: u32) -> Result<Session, OrchestratorError> {
        let mut session = self.store.get_session(session_id).await?;
        if session.stage != SessionStage::Reviewing {
            return Err(OrchestratorError::RejectedByWorker(format!(
                "session {session_id} is not in the reviewing stage"
            )));
        }
        session.current_stage_index += 1;
        session.stage = if session.current_stage_index >= total_stages {
            SessionStage::Done
        } else {
            SessionStage::Generating
        };
        session.updated_at = Utc::now();
        self.store.put_session(&session).await?;
        Ok(session)
    }

    /// Builds a single-image-to-image batch request seeded from the source
    /// job's output, at the default (or caller-supplied) denoise strength.
    #[must_use]
    pub fn more_like_this(&self, source: &Job, denoise: Option<f32>) -> BatchGenerateRequest {
        let mut params = source.params.clone();
        params.source_image = source.artifact_ref.clone();
        params.denoise = Some(denoise.unwrap_or(DEFAULT_MORE_LIKE_THIS_DENOISE));

        BatchGenerateRequest {
            session_id: source.session_id,
            stage: source.stage,
            task_class: source.task_class.clone(),
            count: 1,
            prompt: source.prompt.clone(),
            negative_prompt: source.negative_prompt.clone(),
            candidate_models: vec![source.model_family.clone()],
            candidate_adapters: vec![],
            auto_adapters: false,
            base_params: params,
            seed_start: source.params.seed + 1,
            template_name: None,
        }
    }
}

fn adapter_ids(job: &Job) -> Vec<String> {
    job.params.adapters.iter().map(|a| a.adapter_id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobState, ParameterBundle, TaskClass};
    use crate::store::InMemoryStore;

    fn sample_session() -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            flow_kind: "standard".into(),
            current_stage_index: 0,
            stage: SessionStage::Configuring,
            config: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_job(session_id: Uuid, stage: u32, prompt: &str) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            session_id,
            batch_id: None,
            stage,
            task_class: TaskClass::Standard,
            prompt: prompt.to_string(),
            negative_prompt: String::new(),
            model_family: "sdxl".into(),
            params: ParameterBundle {
                width: 1024,
                height: 1024,
                steps: 30,
                guidance: 7.0,
                sampler: "euler".into(),
                scheduler: "normal".into(),
                seed: 1,
                source_image: None,
                adapters: vec![],
                denoise: None,
            },
            state: JobState::Complete,
            node_id: Some("n1".into()),
            worker_job_id: Some("w-1".into()),
            artifact_ref: Some("out.png".into()),
            final_seed: Some(1),
            duration_ms: Some(1000),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn controller() -> (IterationController, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let controller = IterationController::new(PreferenceEngine::new(), store.clone(), Arc::new(NoopRewriter));
        (controller, store)
    }

    #[tokio::test]
    async fn full_stage_funnel_transitions_in_order() {
        let (controller, store) = controller();
        let session = sample_session();
        store.put_session(&session).await.unwrap();

        let session = controller.begin_generating(session.id).await.unwrap();
        assert_eq!(session.stage, SessionStage::Generating);

        let session = controller.on_batch_complete(session.id).await.unwrap();
        assert_eq!(session.stage, SessionStage::Reviewing);

        let session = controller.advance(session.id, 3).await.unwrap();
        assert_eq!(session.stage, SessionStage::Generating);
        assert_eq!(session.current_stage_index, 1);
    }

    #[tokio::test]
    async fn advance_at_final_stage_reaches_done() {
        let (controller, store) = controller();
        let mut session = sample_session();
        session.stage = SessionStage::Reviewing;
        session.current_stage_index = 2;
        store.put_session(&session).await.unwrap();

        let session = controller.advance(session.id, 3).await.unwrap();
        assert_eq!(session.stage, SessionStage::Done);
    }

    #[tokio::test]
    async fn reject_all_does_not_change_session_stage() {
        let (controller, store) = controller();
        let mut session = sample_session();
        session.stage = SessionStage::Reviewing;
        store.put_session(&session).await.unwrap();

        let job = sample_job(session.id, 0, "a forest");
        controller
            .reject_all(session.id, std::slice::from_ref(&job), Some("too dark".into()))
            .await
            .unwrap();

        let after = store.get_session(session.id).await.unwrap();
        assert_eq!(after.stage, SessionStage::Reviewing);
    }

    #[tokio::test]
    async fn select_invokes_rewriter_and_records_preference() {
        let (controller, store) = controller();
        let mut session = sample_session();
        session.stage = SessionStage::Reviewing;
        store.put_session(&session).await.unwrap();

        let job = sample_job(session.id, 0, "a sunny forest");
        let (prompt, rationale) = controller
            .select(session.id, std::slice::from_ref(&job), None)
            .await
            .unwrap();
        assert_eq!(prompt, "a sunny forest");
        assert!(!rationale.is_empty());
    }

    #[test]
    fn more_like_this_carries_source_image_and_default_denoise() {
        let (controller, _store) = controller();
        let job = sample_job(Uuid::new_v4(), 0, "a cat");
        let request = controller.more_like_this(&job, None);
        assert_eq!(request.base_params.source_image.as_deref(), Some("out.png"));
        assert_eq!(request.base_params.denoise, Some(0.4));
        assert_eq!(request.count, 1);
        assert_eq!(request.seed_start, job.params.seed + 1);
    }
}
