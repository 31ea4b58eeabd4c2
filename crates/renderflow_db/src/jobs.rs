//! Job store: durable record of generation jobs.
//!
//! Status updates are load-then-commit inside a transaction, guarded by the
//! canonical state machine; the `WHERE status = ?` clause on the UPDATE makes
//! concurrent writers lose cleanly instead of clobbering a terminal row.

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::types::Json;
use tracing::info;

use renderflow_protocol::defaults::{CANCELLED_PREFIX, MAX_PROMPT_CHARS};
use renderflow_protocol::{JobId, JobKind, JobStatus};

use crate::error::{DbError, Result};
use crate::models::{Job, NewJob};
use crate::pool::DbPool;

pub struct JobStore {
    pool: DbPool,
}

impl JobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Insert a new job with status `pending`.
    ///
    /// Enforces the row invariants here so no caller can slip an invalid row
    /// past the engine: non-empty bounded prompt, existing active user.
    pub async fn insert(&self, new: NewJob) -> Result<Job> {
        let prompt = new.prompt.trim();
        if prompt.is_empty() {
            return Err(DbError::validation("Prompt cannot be empty"));
        }
        if new.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(DbError::validation(format!(
                "Prompt cannot exceed {MAX_PROMPT_CHARS} characters"
            )));
        }

        let user_id = new.user_id.to_string();
        let active: Option<bool> =
            sqlx::query_scalar("SELECT is_active FROM users WHERE id = ?")
                .bind(&user_id)
                .fetch_optional(&self.pool)
                .await?;
        match active {
            None => return Err(DbError::not_found(format!("user {user_id}"))),
            Some(false) => {
                return Err(DbError::validation(
                    "Cannot create generation jobs for inactive users",
                ))
            }
            Some(true) => {}
        }

        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO generation_jobs (
                user_id, job_type, status, prompt, negative_prompt,
                checkpoint_model, lora_models, width, height, batch_size,
                sampler_params, params, backend, created_at, updated_at
            ) VALUES (?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&user_id)
        .bind(new.job_type.as_str())
        .bind(prompt)
        .bind(&new.negative_prompt)
        .bind(&new.checkpoint_model)
        .bind(Json(&new.lora_models))
        .bind(new.width.map(|v| v as i64))
        .bind(new.height.map(|v| v as i64))
        .bind(new.batch_size.map(|v| v as i64))
        .bind(Json(&new.sampler_params))
        .bind(Json(&new.params))
        .bind(new.backend.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        info!("Created job {} for user {}", id, user_id);
        self.get(JobId::new(id)).await
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM generation_jobs WHERE id = ?")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found(format!("job {id}")))
    }

    /// Record the queue dispatch token after enqueue.
    pub async fn set_dispatch_token(&self, id: JobId, token: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE generation_jobs SET dispatch_token = ?, updated_at = ? WHERE id = ?",
        )
        .bind(token)
        .bind(Utc::now())
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(DbError::not_found(format!("job {id}")));
        }
        Ok(())
    }

    /// Record the backend correlation id. Immutable once set.
    pub async fn set_correlation_id(&self, id: JobId, correlation_id: &str) -> Result<()> {
        let job = self.get(id).await?;
        if let Some(existing) = &job.backend_correlation_id {
            if existing != correlation_id {
                return Err(DbError::invalid_state(format!(
                    "job {id} already has backend correlation id {existing}"
                )));
            }
            return Ok(());
        }
        sqlx::query(
            "UPDATE generation_jobs SET backend_correlation_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(correlation_id)
        .bind(Utc::now())
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// pending -> running. Sets started_at, clears error_message.
    pub async fn mark_running(&self, id: JobId) -> Result<Job> {
        let now = Utc::now();
        self.transition(id, JobStatus::Running, move |query| {
            query
                .push(", started_at = ")
                .push_bind(now)
                .push(", error_message = NULL");
        })
        .await
    }

    /// running -> completed. Sets content_id/completed_at; optionally replaces
    /// the params column with the final metadata map.
    pub async fn mark_completed(
        &self,
        id: JobId,
        content_id: i64,
        final_params: Option<&Map<String, Value>>,
    ) -> Result<Job> {
        let now = Utc::now();
        let params_json = match final_params {
            Some(map) => Some(serde_json::to_string(map)?),
            None => None,
        };
        self.transition(id, JobStatus::Completed, move |query| {
            query
                .push(", content_id = ")
                .push_bind(content_id)
                .push(", completed_at = ")
                .push_bind(now)
                .push(", error_message = NULL");
            if let Some(params) = params_json {
                query.push(", params = ").push_bind(params);
            }
        })
        .await
    }

    /// {pending, running} -> failed with a non-empty error message.
    pub async fn mark_failed(&self, id: JobId, error_message: &str) -> Result<Job> {
        let error_message = error_message.trim();
        if error_message.is_empty() {
            return Err(DbError::validation(
                "Error message cannot be empty when failing a job",
            ));
        }
        let now = Utc::now();
        let message = error_message.to_string();
        self.transition(id, JobStatus::Failed, move |query| {
            query
                .push(", error_message = ")
                .push_bind(message)
                .push(", completed_at = ")
                .push_bind(now);
        })
        .await
    }

    /// {pending, running} -> cancelled. A reason is stored as a
    /// `Cancelled: <reason>` error message.
    pub async fn mark_cancelled(&self, id: JobId, reason: Option<&str>) -> Result<Job> {
        let now = Utc::now();
        let message = reason.map(|r| format!("{CANCELLED_PREFIX}{}", r.trim()));
        self.transition(id, JobStatus::Cancelled, move |query| {
            query.push(", completed_at = ").push_bind(now);
            if let Some(message) = message {
                query.push(", error_message = ").push_bind(message);
            }
        })
        .await
    }

    /// Replace the params map. Only pending jobs can be edited.
    pub async fn update_params(&self, id: JobId, params: &Map<String, Value>) -> Result<Job> {
        let job = self.get(id).await?;
        if job.status != JobStatus::Pending {
            return Err(DbError::invalid_state("Can only update pending jobs"));
        }
        sqlx::query("UPDATE generation_jobs SET params = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(params)?)
            .bind(Utc::now())
            .bind(id.as_i64())
            .execute(&self.pool)
            .await?;
        self.get(id).await
    }

    /// Delete a job row. Non-terminal jobs are never deleted.
    pub async fn delete(&self, id: JobId) -> Result<()> {
        let job = self.get(id).await?;
        if !job.status.is_terminal() {
            return Err(DbError::invalid_state(
                "Cannot delete pending or running jobs",
            ));
        }
        sqlx::query("DELETE FROM generation_jobs WHERE id = ?")
            .bind(id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn list_by_user(
        &self,
        user_id: &str,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, Job>(
                    r#"
                    SELECT * FROM generation_jobs
                    WHERE user_id = ? AND status = ?
                    ORDER BY created_at DESC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(user_id)
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>(
                    r#"
                    SELECT * FROM generation_jobs
                    WHERE user_id = ?
                    ORDER BY created_at DESC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(user_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(jobs)
    }

    pub async fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM generation_jobs
            WHERE status = ?
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(status.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn list_by_kind(&self, kind: JobKind, limit: i64, offset: i64) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM generation_jobs
            WHERE job_type = ?
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(kind.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Completed jobs within the last `days`, optionally for one user.
    pub async fn completed_within_days(
        &self,
        user_id: Option<&str>,
        days: i64,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let jobs = match user_id {
            Some(user_id) => {
                sqlx::query_as::<_, Job>(
                    r#"
                    SELECT * FROM generation_jobs
                    WHERE status = 'completed' AND user_id = ? AND completed_at >= ?
                    ORDER BY completed_at DESC
                    LIMIT ?
                    "#,
                )
                .bind(user_id)
                .bind(cutoff)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>(
                    r#"
                    SELECT * FROM generation_jobs
                    WHERE status = 'completed' AND completed_at >= ?
                    ORDER BY completed_at DESC
                    LIMIT ?
                    "#,
                )
                .bind(cutoff)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(jobs)
    }

    /// Pending jobs in FIFO order.
    pub async fn pending_fifo(&self, limit: i64) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT * FROM generation_jobs WHERE status = 'pending' ORDER BY id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn running(&self) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT * FROM generation_jobs WHERE status = 'running' ORDER BY started_at ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Aggregate counts per status (queue statistics).
    pub async fn count_by_status(&self) -> Result<QueueTotals> {
        let totals: QueueTotals = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending_jobs,
                COUNT(*) FILTER (WHERE status = 'running') as running_jobs,
                COUNT(*) FILTER (WHERE status = 'completed') as completed_jobs,
                COUNT(*) FILTER (WHERE status = 'failed') as failed_jobs,
                COUNT(*) FILTER (WHERE status = 'cancelled') as cancelled_jobs,
                COUNT(*) as total_jobs
            FROM generation_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(totals)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Load-check-commit transition to `to`. `extra` appends the
    /// status-specific column updates to the UPDATE statement.
    async fn transition<F>(&self, id: JobId, to: JobStatus, extra: F) -> Result<Job>
    where
        F: FnOnce(&mut sqlx::QueryBuilder<'_, sqlx::Sqlite>),
    {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>("SELECT * FROM generation_jobs WHERE id = ?")
            .bind(id.as_i64())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::not_found(format!("job {id}")))?;

        if !job.status.can_transition_to(to) {
            return Err(DbError::invalid_state(format!(
                "Cannot move job {id} from '{}' to '{}'",
                job.status, to
            )));
        }

        let mut query = sqlx::QueryBuilder::new("UPDATE generation_jobs SET status = ");
        query.push_bind(to.as_str());
        query.push(", updated_at = ").push_bind(Utc::now());
        extra(&mut query);
        query.push(" WHERE id = ").push_bind(id.as_i64());
        query.push(" AND status = ").push_bind(job.status.as_str());

        let updated = query.build().execute(&mut *tx).await?.rows_affected();
        if updated == 0 {
            // Lost a race with a concurrent transition.
            return Err(DbError::invalid_state(format!(
                "job {id} was updated concurrently"
            )));
        }

        let job = sqlx::query_as::<_, Job>("SELECT * FROM generation_jobs WHERE id = ?")
            .bind(id.as_i64())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Job {} -> {}", id, to);
        Ok(job)
    }
}

#[derive(Debug, Clone, Copy, sqlx::FromRow, serde::Serialize)]
pub struct QueueTotals {
    pub pending_jobs: i64,
    pub running_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub cancelled_jobs: i64,
    pub total_jobs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};
    use crate::schema::ensure_schema;
    use uuid::Uuid;

    async fn setup() -> (DbPool, Uuid) {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let user_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO users (id, username, email, is_active, created_at) VALUES (?, 'tester', 'tester@example.com', 1, ?)",
        )
        .bind(user_id.to_string())
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();
        (pool, user_id)
    }

    fn new_job(user_id: Uuid, prompt: &str) -> NewJob {
        NewJob {
            user_id,
            job_type: JobKind::Image,
            prompt: prompt.to_string(),
            negative_prompt: None,
            checkpoint_model: None,
            lora_models: vec![],
            width: Some(832),
            height: Some(1216),
            batch_size: Some(1),
            sampler_params: Default::default(),
            params: Map::new(),
            backend: Default::default(),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() {
        let (pool, user_id) = setup().await;
        let store = JobStore::new(pool);

        let job = store.insert(new_job(user_id, "sunrise")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.prompt, "sunrise");
        assert!(job.content_id.is_none());

        let fetched = store.get(job.job_id()).await.unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.width, Some(832));
    }

    #[tokio::test]
    async fn insert_rejects_empty_and_oversized_prompts() {
        let (pool, user_id) = setup().await;
        let store = JobStore::new(pool);

        let err = store.insert(new_job(user_id, "   ")).await.unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));

        let max = "x".repeat(MAX_PROMPT_CHARS);
        assert!(store.insert(new_job(user_id, &max)).await.is_ok());

        let over = "x".repeat(MAX_PROMPT_CHARS + 1);
        let err = store.insert(new_job(user_id, &over)).await.unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[tokio::test]
    async fn insert_rejects_unknown_and_inactive_users() {
        let (pool, user_id) = setup().await;
        let store = JobStore::new(pool.clone());

        let err = store
            .insert(new_job(Uuid::new_v4(), "sunrise"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));

        sqlx::query("UPDATE users SET is_active = 0 WHERE id = ?")
            .bind(user_id.to_string())
            .execute(&pool)
            .await
            .unwrap();
        let err = store.insert(new_job(user_id, "sunrise")).await.unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let (pool, user_id) = setup().await;
        let store = JobStore::new(pool.clone());
        let job = store.insert(new_job(user_id, "sunrise")).await.unwrap();
        let id = job.job_id();

        let running = store.mark_running(id).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        // Content row so the FK holds.
        let content_id: i64 = sqlx::query_scalar(
            "INSERT INTO content_items (creator_id, title, content_type, content_data, created_at) VALUES (?, 't', 'image', '/out/a.png', ?) RETURNING id",
        )
        .bind(user_id.to_string())
        .bind(Utc::now())
        .fetch_one(&pool)
        .await
        .unwrap();

        let completed = store.mark_completed(id, content_id, None).await.unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(completed.content_id, Some(content_id));
        assert!(completed.started_at.unwrap() <= completed.completed_at.unwrap());

        // Terminal: no further transitions.
        let err = store.mark_failed(id, "late failure").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
        let err = store.mark_cancelled(id, None).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn failed_jobs_keep_error_message() {
        let (pool, user_id) = setup().await;
        let store = JobStore::new(pool);
        let job = store.insert(new_job(user_id, "sunrise")).await.unwrap();
        store.mark_running(job.job_id()).await.unwrap();

        let failed = store
            .mark_failed(job.job_id(), "GPU OOM")
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("GPU OOM"));

        let err = store.mark_failed(job.job_id(), "again").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn cancellation_reason_is_prefixed() {
        let (pool, user_id) = setup().await;
        let store = JobStore::new(pool);
        let job = store.insert(new_job(user_id, "sunrise")).await.unwrap();

        let cancelled = store
            .mark_cancelled(job.job_id(), Some("user changed mind"))
            .await
            .unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(
            cancelled.error_message.as_deref(),
            Some("Cancelled: user changed mind")
        );

        let err = store
            .mark_cancelled(job.job_id(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn delete_rejects_live_jobs() {
        let (pool, user_id) = setup().await;
        let store = JobStore::new(pool);
        let job = store.insert(new_job(user_id, "sunrise")).await.unwrap();

        let err = store.delete(job.job_id()).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));

        store.mark_cancelled(job.job_id(), None).await.unwrap();
        store.delete(job.job_id()).await.unwrap();
        assert!(matches!(
            store.get(job.job_id()).await,
            Err(DbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn correlation_id_is_immutable() {
        let (pool, user_id) = setup().await;
        let store = JobStore::new(pool);
        let job = store.insert(new_job(user_id, "sunrise")).await.unwrap();

        store
            .set_correlation_id(job.job_id(), "prompt-abc")
            .await
            .unwrap();
        // Same value is a no-op.
        store
            .set_correlation_id(job.job_id(), "prompt-abc")
            .await
            .unwrap();
        let err = store
            .set_correlation_id(job.job_id(), "prompt-xyz")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn queue_totals_count_by_status() {
        let (pool, user_id) = setup().await;
        let store = JobStore::new(pool);

        let a = store.insert(new_job(user_id, "one")).await.unwrap();
        let _b = store.insert(new_job(user_id, "two")).await.unwrap();
        store.mark_running(a.job_id()).await.unwrap();

        let totals = store.count_by_status().await.unwrap();
        assert_eq!(totals.pending_jobs, 1);
        assert_eq!(totals.running_jobs, 1);
        assert_eq!(totals.total_jobs, 2);
    }
}
