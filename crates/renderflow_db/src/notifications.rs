//! Notification store. Writes are best-effort: the engine logs failures and
//! never lets them affect a job.

use chrono::Utc;
use tracing::info;

use renderflow_protocol::defaults::NOTIFICATION_ERROR_MAX_CHARS;
use renderflow_protocol::JobId;

use crate::error::Result;
use crate::models::Notification;
use crate::pool::DbPool;

pub struct NotificationStore {
    pool: DbPool,
}

impl NotificationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create_job_completion(
        &self,
        user_id: &str,
        job_id: JobId,
        content_id: i64,
    ) -> Result<()> {
        self.insert(
            user_id,
            "Generation complete",
            &format!("Your generation job {job_id} finished successfully."),
            "job_completed",
            Some(job_id.as_i64()),
            Some(content_id),
        )
        .await
    }

    pub async fn create_job_failure(
        &self,
        user_id: &str,
        job_id: JobId,
        error_message: &str,
    ) -> Result<()> {
        let truncated: String = error_message
            .chars()
            .take(NOTIFICATION_ERROR_MAX_CHARS)
            .collect();
        self.insert(
            user_id,
            "Generation failed",
            &format!("Your generation job {job_id} failed: {truncated}"),
            "job_failed",
            Some(job_id.as_i64()),
            None,
        )
        .await
    }

    pub async fn list_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>> {
        Ok(sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn insert(
        &self,
        user_id: &str,
        title: &str,
        message: &str,
        kind: &str,
        job_id: Option<i64>,
        content_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (user_id, title, message, kind, job_id, content_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(title)
        .bind(message)
        .bind(kind)
        .bind(job_id)
        .bind(content_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        info!("Notification '{}' created for user {}", kind, user_id);
        Ok(())
    }
}
