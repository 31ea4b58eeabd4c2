//! Task queue over the `worker_tasks` table.
//!
//! Claims are atomic `UPDATE ... WHERE status = 'queued'` flips, FIFO by id
//! within the listened queues. Retryable failures re-queue with exponential
//! backoff (1s, 2s, 4s, ... capped at 600s) until the retry budget runs out.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::types::Json;
use tracing::info;
use uuid::Uuid;

use renderflow_db::{DbError, DbPool, Result};
use renderflow_protocol::TaskStatus;

use crate::cancel::CancelRegistry;
use crate::tasks;

/// Retry backoff ceiling in seconds.
const BACKOFF_CAP_SECS: i64 = 600;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkerTask {
    pub id: i64,
    pub task_name: String,
    pub args: Json<Value>,
    pub queue: String,
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    pub dispatch_token: String,
    pub retry_count: i64,
    pub max_retries: i64,
    pub not_before: DateTime<Utc>,
    pub soft_limit_secs: Option<i64>,
    pub hard_limit_secs: Option<i64>,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Everything needed to enqueue a task outside the default routing.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_name: String,
    pub args: Value,
    pub queue: String,
    pub max_retries: i64,
    pub soft_limit_secs: Option<i64>,
    pub hard_limit_secs: Option<i64>,
}

impl TaskSpec {
    /// Spec with the standard routing and limits for `task_name`.
    pub fn named(task_name: &str, args: Value) -> Self {
        let (soft, hard) = tasks::time_limits_for(task_name);
        Self {
            task_name: task_name.to_string(),
            args,
            queue: tasks::queue_for(task_name).to_string(),
            max_retries: tasks::max_retries_for(task_name),
            soft_limit_secs: soft,
            hard_limit_secs: hard,
        }
    }
}

/// What happened to a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Re-queued with the given delay in seconds.
    Retried { delay_secs: i64 },
    /// Retry budget exhausted (or error not retryable); row is failed.
    Failed,
}

pub struct TaskQueue {
    pool: DbPool,
    cancels: Arc<CancelRegistry>,
}

impl TaskQueue {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            cancels: Arc::new(CancelRegistry::new()),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn cancel_registry(&self) -> Arc<CancelRegistry> {
        self.cancels.clone()
    }

    /// Enqueue with standard routing; returns the dispatch token.
    pub async fn enqueue(&self, task_name: &str, args: Value) -> Result<String> {
        self.enqueue_with(TaskSpec::named(task_name, args)).await
    }

    pub async fn enqueue_with(&self, spec: TaskSpec) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO worker_tasks (
                task_name, args, queue, status, dispatch_token, max_retries,
                not_before, soft_limit_secs, hard_limit_secs, created_at
            ) VALUES (?, ?, ?, 'queued', ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&spec.task_name)
        .bind(Json(&spec.args))
        .bind(&spec.queue)
        .bind(&token)
        .bind(spec.max_retries)
        .bind(now)
        .bind(spec.soft_limit_secs)
        .bind(spec.hard_limit_secs)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!("Enqueued {} on '{}' ({})", spec.task_name, spec.queue, token);
        Ok(token)
    }

    /// Atomically claim the next due task on the listened queues.
    pub async fn claim(&self, queues: &[&str], worker_id: &str) -> Result<Option<WorkerTask>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let mut select = sqlx::QueryBuilder::new(
            "SELECT id FROM worker_tasks WHERE status = 'queued' AND not_before <= ",
        );
        select.push_bind(now);
        select.push(" AND queue IN (");
        let mut separated = select.separated(", ");
        for queue in queues {
            separated.push_bind(*queue);
        }
        select.push(") ORDER BY id ASC LIMIT 1");

        let task_id: Option<i64> = select
            .build_query_scalar()
            .fetch_optional(&mut *tx)
            .await?;

        let Some(task_id) = task_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let claimed = sqlx::query(
            r#"
            UPDATE worker_tasks
            SET status = 'running', claimed_by = ?, claimed_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            // Lost the claim race to another worker.
            tx.commit().await?;
            return Ok(None);
        }

        let task: WorkerTask = sqlx::query_as("SELECT * FROM worker_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Claimed task {}: {}", task.id, task.task_name);
        Ok(Some(task))
    }

    /// Mark a task completed.
    pub async fn complete(&self, task_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE worker_tasks SET status = 'completed', finished_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failure, applying the retry policy.
    ///
    /// Retryable errors re-queue with `min(2^retry_count, 600)` seconds of
    /// backoff until `max_retries` deliveries have been retried.
    pub async fn fail(&self, task_id: i64, error: &str, retryable: bool) -> Result<TaskOutcome> {
        let task: WorkerTask = sqlx::query_as("SELECT * FROM worker_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found(format!("task {task_id}")))?;

        let now = Utc::now();
        if retryable && task.retry_count < task.max_retries {
            let delay_secs = backoff_secs(task.retry_count);
            sqlx::query(
                r#"
                UPDATE worker_tasks
                SET status = 'queued',
                    retry_count = retry_count + 1,
                    not_before = ?,
                    last_error = ?,
                    claimed_by = NULL,
                    claimed_at = NULL
                WHERE id = ?
                "#,
            )
            .bind(now + Duration::seconds(delay_secs))
            .bind(error)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            info!(
                "Task {} retry {}/{} in {}s: {}",
                task_id,
                task.retry_count + 1,
                task.max_retries,
                delay_secs,
                error
            );
            return Ok(TaskOutcome::Retried { delay_secs });
        }

        sqlx::query(
            "UPDATE worker_tasks SET status = 'failed', last_error = ?, finished_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        info!("Task {} failed terminally: {}", task_id, error);
        Ok(TaskOutcome::Failed)
    }

    /// Mark a running task revoked (worker-side, after a terminate signal).
    pub async fn mark_revoked(&self, task_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE worker_tasks SET status = 'revoked', finished_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Best-effort cancellation by dispatch token.
    ///
    /// Still-queued tasks are revoked in place. With `terminate`, a task that
    /// has begun executing gets its in-process cancellation token fired.
    /// Returns true when anything was signalled.
    pub async fn revoke(&self, dispatch_token: &str, terminate: bool) -> Result<bool> {
        let revoked = sqlx::query(
            "UPDATE worker_tasks SET status = 'revoked', finished_at = ? WHERE dispatch_token = ? AND status = 'queued'",
        )
        .bind(Utc::now())
        .bind(dispatch_token)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if revoked > 0 {
            info!("Revoked queued task {}", dispatch_token);
            return Ok(true);
        }

        if terminate && self.cancels.cancel(dispatch_token) {
            info!("Signalled running task {} to terminate", dispatch_token);
            return Ok(true);
        }

        Ok(false)
    }

    pub async fn get_by_token(&self, dispatch_token: &str) -> Result<Option<WorkerTask>> {
        Ok(
            sqlx::query_as("SELECT * FROM worker_tasks WHERE dispatch_token = ?")
                .bind(dispatch_token)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Queue statistics.
    pub async fn stats(&self) -> Result<TaskQueueStats> {
        let stats: TaskQueueStats = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued') as queued,
                COUNT(*) FILTER (WHERE status = 'running') as running,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed,
                COUNT(*) FILTER (WHERE status = 'revoked') as revoked
            FROM worker_tasks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }
}

fn backoff_secs(retry_count: i64) -> i64 {
    let exp = retry_count.clamp(0, 32) as u32;
    (1i64 << exp).min(BACKOFF_CAP_SECS)
}

#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct TaskQueueStats {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub revoked: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderflow_db::{create_pool, ensure_schema, DbConfig};
    use serde_json::json;

    async fn setup_queue() -> TaskQueue {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        TaskQueue::new(pool)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_secs(0), 1);
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(3), 8);
        assert_eq!(backoff_secs(12), 600);
    }

    #[tokio::test]
    async fn claim_on_empty_queue_returns_none() {
        let queue = setup_queue().await;
        let task = queue.claim(&["generation", "default"], "w1").await.unwrap();
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn enqueue_routes_and_claims_fifo() {
        let queue = setup_queue().await;
        queue
            .enqueue(tasks::RUN_GENERATION_JOB, json!({"job_id": 1}))
            .await
            .unwrap();
        queue
            .enqueue(tasks::RUN_GENERATION_JOB, json!({"job_id": 2}))
            .await
            .unwrap();
        queue
            .enqueue(tasks::TRANSFER_ROUTE_ANALYTICS, json!({}))
            .await
            .unwrap();

        // Generation queue only sees generation tasks, in FIFO order.
        let first = queue
            .claim(&[tasks::GENERATION_QUEUE], "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.args.0["job_id"], 1);
        assert_eq!(first.status, TaskStatus::Running);
        assert_eq!(first.claimed_by.as_deref(), Some("w1"));

        let second = queue
            .claim(&[tasks::GENERATION_QUEUE], "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.args.0["job_id"], 2);

        assert!(queue
            .claim(&[tasks::GENERATION_QUEUE], "w1")
            .await
            .unwrap()
            .is_none());

        let transfer = queue
            .claim(&[tasks::DEFAULT_QUEUE], "w2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transfer.task_name, tasks::TRANSFER_ROUTE_ANALYTICS);
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_backoff() {
        let queue = setup_queue().await;
        queue
            .enqueue(tasks::RUN_GENERATION_JOB, json!({"job_id": 1}))
            .await
            .unwrap();

        let task = queue
            .claim(&[tasks::GENERATION_QUEUE], "w1")
            .await
            .unwrap()
            .unwrap();

        let outcome = queue.fail(task.id, "backend connection lost", true).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Retried { delay_secs: 1 });

        // Backoff gate: not claimable until not_before elapses.
        assert!(queue
            .claim(&[tasks::GENERATION_QUEUE], "w1")
            .await
            .unwrap()
            .is_none());

        let row: WorkerTask = sqlx::query_as("SELECT * FROM worker_tasks WHERE id = ?")
            .bind(task.id)
            .fetch_one(queue.pool())
            .await
            .unwrap();
        assert_eq!(row.status, TaskStatus::Queued);
        assert_eq!(row.retry_count, 1);
        assert!(row.not_before > Utc::now());
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails_terminally() {
        let queue = setup_queue().await;
        queue
            .enqueue(tasks::RUN_GENERATION_JOB, json!({"job_id": 1}))
            .await
            .unwrap();
        let task = queue
            .claim(&[tasks::GENERATION_QUEUE], "w1")
            .await
            .unwrap()
            .unwrap();

        // Exhaust the budget directly.
        sqlx::query("UPDATE worker_tasks SET retry_count = max_retries WHERE id = ?")
            .bind(task.id)
            .execute(queue.pool())
            .await
            .unwrap();

        let outcome = queue.fail(task.id, "still broken", true).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed);
    }

    #[tokio::test]
    async fn non_retryable_failure_never_requeues() {
        let queue = setup_queue().await;
        queue
            .enqueue(tasks::RUN_GENERATION_JOB, json!({"job_id": 1}))
            .await
            .unwrap();
        let task = queue
            .claim(&[tasks::GENERATION_QUEUE], "w1")
            .await
            .unwrap()
            .unwrap();

        let outcome = queue.fail(task.id, "validation error", false).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed);
    }

    #[tokio::test]
    async fn revoke_queued_task() {
        let queue = setup_queue().await;
        let token = queue
            .enqueue(tasks::RUN_GENERATION_JOB, json!({"job_id": 1}))
            .await
            .unwrap();

        assert!(queue.revoke(&token, true).await.unwrap());
        assert!(queue
            .claim(&[tasks::GENERATION_QUEUE], "w1")
            .await
            .unwrap()
            .is_none());

        let row = queue.get_by_token(&token).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Revoked);
    }

    #[tokio::test]
    async fn revoke_running_task_fires_cancel_token() {
        let queue = setup_queue().await;
        let token = queue
            .enqueue(tasks::RUN_GENERATION_JOB, json!({"job_id": 1}))
            .await
            .unwrap();
        let task = queue
            .claim(&[tasks::GENERATION_QUEUE], "w1")
            .await
            .unwrap()
            .unwrap();

        let registry = queue.cancel_registry();
        let cancel = registry.register(&task.dispatch_token);

        assert!(queue.revoke(&token, true).await.unwrap());
        assert!(cancel.is_cancelled());

        // Without terminate, a running task cannot be signalled.
        registry.remove(&task.dispatch_token);
        assert!(!queue.revoke(&token, false).await.unwrap());
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let queue = setup_queue().await;
        queue.enqueue(tasks::TRANSFER_ROUTE_ANALYTICS, json!({})).await.unwrap();
        queue.enqueue(tasks::TRANSFER_GENERATION_EVENTS, json!({})).await.unwrap();
        let task = queue
            .claim(&[tasks::DEFAULT_QUEUE], "w1")
            .await
            .unwrap()
            .unwrap();
        queue.complete(task.id).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.completed, 1);
    }
}
