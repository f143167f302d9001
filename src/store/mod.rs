//! Persistence layer: an `OrchestratorStore` trait abstracting session,
//! job, and batch storage, with an in-memory default implementation and a
//! Postgres-backed one sharing the same interface — the same seam the
//! teacher crate draws between `RecapDao` and its in-memory mock.
mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    model::{Batch, Job, Session},
    util::error::OrchestratorError,
};

#[async_trait]
pub trait OrchestratorStore: Send + Sync {
    async fn put_session(&self, session: &Session) -> Result<(), OrchestratorError>;
    async fn get_session(&self, id: Uuid) -> Result<Session, OrchestratorError>;
    async fn delete_session(&self, id: Uuid) -> Result<(), OrchestratorError>;

    async fn put_job(&self, job: &Job) -> Result<(), OrchestratorError>;
    async fn get_job(&self, id: Uuid) -> Result<Job, OrchestratorError>;
    async fn list_jobs_by_session(
        &self,
        session_id: Uuid,
        stage: Option<u32>,
    ) -> Result<Vec<Job>, OrchestratorError>;

    async fn put_batch(&self, batch: &Batch) -> Result<(), OrchestratorError>;
    async fn get_batch(&self, id: Uuid) -> Result<Batch, OrchestratorError>;
}
