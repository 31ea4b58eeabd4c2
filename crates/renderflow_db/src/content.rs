//! Content store: artifacts produced by completed jobs.

use chrono::Utc;
use sqlx::types::Json;
use tracing::info;

use crate::error::{DbError, Result};
use crate::models::{Content, NewContent};
use crate::pool::DbPool;

pub struct ContentStore {
    pool: DbPool,
}

impl ContentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a content row. Immutable thereafter from the core's view.
    pub async fn insert(&self, new: NewContent) -> Result<Content> {
        if new.title.trim().is_empty() {
            return Err(DbError::validation("Content title cannot be empty"));
        }
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO content_items (
                creator_id, title, content_type, content_data, prompt,
                item_metadata, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(new.creator_id.to_string())
        .bind(&new.title)
        .bind(&new.content_type)
        .bind(&new.content_data)
        .bind(&new.prompt)
        .bind(Json(&new.item_metadata))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        info!("Created content {} for user {}", id, new.creator_id);
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Content> {
        sqlx::query_as::<_, Content>("SELECT * FROM content_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found(format!("content {id}")))
    }

    pub async fn exists(&self, id: i64) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM content_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}
