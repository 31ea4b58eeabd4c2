//! Shared test fixtures.
//!
//! In-memory pools with the schema applied and seeded users, so integration
//! tests across crates build the same world the same way.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use renderflow_db::{create_pool, ensure_schema, DbConfig, DbPool, UserStore};
use renderflow_protocol::Settings;

/// Fresh in-memory pool with all tables created.
pub async fn test_pool() -> DbPool {
    let pool = create_pool(DbConfig::sqlite_memory())
        .await
        .expect("failed to create test pool");
    ensure_schema(&pool).await.expect("failed to apply schema");
    pool
}

/// Seed an active user and return its id.
pub async fn seed_user(pool: &DbPool) -> Uuid {
    let user_id = Uuid::new_v4();
    UserStore::new(pool.clone())
        .insert(user_id, "tester", "tester@example.com")
        .await
        .expect("failed to seed user");
    user_id
}

/// Test settings: in-memory database, `renderflow_test` namespace.
pub fn test_settings() -> Settings {
    Settings::for_tests()
}

/// Insert one raw route-analytics row directly (bypasses capture/transfer).
#[allow(clippy::too_many_arguments)]
pub async fn seed_route_analytics_row(
    pool: &DbPool,
    route: &str,
    method: &str,
    at: DateTime<Utc>,
    duration_ms: i64,
    status_code: i64,
    user_id: Option<&str>,
    query_params_normalized: &str,
) {
    sqlx::query(
        r#"
        INSERT INTO route_analytics (
            route, method, user_id, timestamp, duration_ms, status_code,
            query_params, query_params_normalized, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, '{}', ?, ?)
        "#,
    )
    .bind(route)
    .bind(method)
    .bind(user_id)
    .bind(at)
    .bind(duration_ms)
    .bind(status_code)
    .bind(query_params_normalized)
    .bind(at)
    .execute(pool)
    .await
    .expect("failed to seed route analytics row");
}
