//! User store. The core only reads users; inserts exist for seeds and tests.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::models::User;
use crate::pool::DbPool;

pub struct UserStore {
    pool: DbPool,
}

impl UserStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found(format!("user {id}")))
    }

    pub async fn insert(&self, id: Uuid, username: &str, email: &str) -> Result<User> {
        sqlx::query(
            "INSERT INTO users (id, username, email, is_active, created_at) VALUES (?, ?, ?, 1, ?)",
        )
        .bind(id.to_string())
        .bind(username)
        .bind(email)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.get(id).await
    }

    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<()> {
        let updated = sqlx::query("UPDATE users SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(DbError::not_found(format!("user {id}")));
        }
        Ok(())
    }
}
