use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::OrchestratorStore;
use crate::{
    model::{Batch, Job, Session},
    util::error::OrchestratorError,
};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<Uuid, Session>,
    jobs: HashMap<Uuid, Job>,
    batches: HashMap<Uuid, Batch>,
}

/// The default, zero-configuration store: everything lives in a
/// `tokio::sync::RwLock`-guarded set of maps. Used in tests and whenever no
/// `database_url` is configured.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrchestratorStore for InMemoryStore {
    async fn put_session(&self, session: &Session) -> Result<(), OrchestratorError> {
        let mut guard = self.state.write().await;
        guard.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Session, OrchestratorError> {
        let guard = self.state.read().await;
        guard
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {id}")))
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), OrchestratorError> {
        let mut guard = self.state.write().await;
        guard.sessions.remove(&id);
        guard.jobs.retain(|_, job| job.session_id != id);
        guard.batches.retain(|_, batch| batch.session_id != id);
        Ok(())
    }

    async fn put_job(&self, job: &Job) -> Result<(), OrchestratorError> {
        let mut guard = self.state.write().await;
        guard.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, OrchestratorError> {
        let guard = self.state.read().await;
        guard
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {id}")))
    }

    async fn list_jobs_by_session(
        &self,
        session_id: Uuid,
        stage: Option<u32>,
    ) -> Result<Vec<Job>, OrchestratorError> {
        let guard = self.state.read().await;
        let mut jobs: Vec<Job> = guard
            .jobs
            .values()
            .filter(|job| job.session_id == session_id)
            .filter(|job| stage.is_none_or(|s| job.stage == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn put_batch(&self, batch: &Batch) -> Result<(), OrchestratorError> {
        let mut guard = self.state.write().await;
        guard.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Batch, OrchestratorError> {
        let guard = self.state.read().await;
        guard
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("batch {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobState, ParameterBundle, SessionStage, TaskClass};
    use chrono::Utc;

    fn sample_job(session_id: Uuid, stage: u32) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            session_id,
            batch_id: None,
            stage,
            task_class: TaskClass::Draft,
            prompt: "a cat".into(),
            negative_prompt: String::new(),
            model_family: "sd15".into(),
            params: ParameterBundle {
                width: 512,
                height: 512,
                steps: 20,
                guidance: 7.0,
                sampler: "euler".into(),
                scheduler: "normal".into(),
                seed: 1,
                source_image: None,
                adapters: vec![],
                denoise: None,
            },
            state: JobState::Queued,
            node_id: None,
            worker_job_id: None,
            artifact_ref: None,
            final_seed: None,
            duration_ms: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

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

    #[tokio::test]
    async fn put_then_get_session_round_trips() {
        let store = InMemoryStore::new();
        let session = sample_session();
        store.put_session(&session).await.unwrap();
        let fetched = store.get_session(session.id).await.unwrap();
        assert_eq!(fetched.id, session.id);
    }

    #[tokio::test]
    async fn get_missing_session_is_not_found() {
        let store = InMemoryStore::new();
        let error = store.get_session(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(error, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_jobs_by_session_filters_by_stage() {
        let store = InMemoryStore::new();
        let session_id = Uuid::new_v4();
        store.put_job(&sample_job(session_id, 0)).await.unwrap();
        store.put_job(&sample_job(session_id, 1)).await.unwrap();
        store.put_job(&sample_job(Uuid::new_v4(), 0)).await.unwrap();

        let stage0 = store.list_jobs_by_session(session_id, Some(0)).await.unwrap();
        assert_eq!(stage0.len(), 1);

        let all = store.list_jobs_by_session(session_id, None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn delete_session_cascades_to_jobs_and_batches() {
        let store = InMemoryStore::new();
        let session = sample_session();
        store.put_session(&session).await.unwrap();
        store.put_job(&sample_job(session.id, 0)).await.unwrap();

        store.delete_session(session.id).await.unwrap();
        assert!(store.get_session(session.id).await.is_err());
        assert!(store
            .list_jobs_by_session(session.id, None)
            .await
            .unwrap()
            .is_empty());
    }
}
