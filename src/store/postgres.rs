use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::OrchestratorStore;
use crate::{
    model::{Batch, Job, Session},
    util::error::OrchestratorError,
};

/// Stores each entity as a single JSONB blob keyed by id, the same shape the
/// teacher crate uses for `save_stage_state`/`load_stage_state`. A `stage`
/// column on `jobs` is kept denormalized so `list_jobs_by_session` can push
/// the filter down to SQL instead of scanning a decoded column.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the backing tables if they do not already exist. Intended to
    /// be called once at startup; real deployments would drive this from a
    /// migrations directory instead.
    pub async fn ensure_schema(&self) -> Result<(), OrchestratorError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (id UUID PRIMARY KEY, data JSONB NOT NULL)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                session_id UUID NOT NULL,
                stage INTEGER NOT NULL,
                data JSONB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS batches (id UUID PRIMARY KEY, session_id UUID NOT NULL, data JSONB NOT NULL)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl OrchestratorStore for PostgresStore {
    async fn put_session(&self, session: &Session) -> Result<(), OrchestratorError> {
        sqlx::query(
            "INSERT INTO sessions (id, data) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(session.id)
        .bind(Json(session))
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Session, OrchestratorError> {
        let row: Option<(Json<Session>,)> = sqlx::query_as("SELECT data FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        row.map(|(Json(session),)| session)
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {id}")))
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), OrchestratorError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        sqlx::query("DELETE FROM jobs WHERE session_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        sqlx::query("DELETE FROM batches WHERE session_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        Ok(())
    }

    async fn put_job(&self, job: &Job) -> Result<(), OrchestratorError> {
        sqlx::query(
            "INSERT INTO jobs (id, session_id, stage, data) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET stage = EXCLUDED.stage, data = EXCLUDED.data",
        )
        .bind(job.id)
        .bind(job.session_id)
        .bind(i32::try_from(job.stage).unwrap_or(i32::MAX))
        .bind(Json(job))
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, OrchestratorError> {
        let row: Option<(Json<Job>,)> = sqlx::query_as("SELECT data FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        row.map(|(Json(job),)| job)
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {id}")))
    }

    async fn list_jobs_by_session(
        &self,
        session_id: Uuid,
        stage: Option<u32>,
    ) -> Result<Vec<Job>, OrchestratorError> {
        let rows: Vec<(Json<Job>,)> = match stage {
            Some(stage) => sqlx::query_as(
                "SELECT data FROM jobs WHERE session_id = $1 AND stage = $2 ORDER BY id",
            )
            .bind(session_id)
            .bind(i32::try_from(stage).unwrap_or(i32::MAX))
            .fetch_all(&self.pool)
            .await,
            None => {
                sqlx::query_as("SELECT data FROM jobs WHERE session_id = $1 ORDER BY id")
                    .bind(session_id)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        Ok(rows.into_iter().map(|(Json(job),)| job).collect())
    }

    async fn put_batch(&self, batch: &Batch) -> Result<(), OrchestratorError> {
        sqlx::query(
            "INSERT INTO batches (id, session_id, data) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(batch.id)
        .bind(batch.session_id)
        .bind(Json(batch))
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Batch, OrchestratorError> {
        let row: Option<(Json<Batch>,)> = sqlx::query_as("SELECT data FROM batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        row.map(|(Json(batch),)| batch)
            .ok_or_else(|| OrchestratorError::NotFound(format!("batch {id}")))
    }
}
