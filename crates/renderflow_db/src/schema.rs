//! Schema bootstrap.
//!
//! All tables are created idempotently; `ensure_schema` is safe to run on
//! every process start and in every test.

use crate::error::Result;
use crate::pool::DbPool;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL,
        email TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        preferences TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS content_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        creator_id TEXT NOT NULL REFERENCES users(id),
        title TEXT NOT NULL,
        content_type TEXT NOT NULL,
        content_data TEXT NOT NULL,
        prompt TEXT NOT NULL DEFAULT '',
        item_metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generation_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL REFERENCES users(id),
        job_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        prompt TEXT NOT NULL,
        negative_prompt TEXT,
        checkpoint_model TEXT,
        lora_models TEXT NOT NULL DEFAULT '[]',
        width INTEGER,
        height INTEGER,
        batch_size INTEGER,
        sampler_params TEXT NOT NULL DEFAULT '{}',
        params TEXT NOT NULL DEFAULT '{}',
        backend TEXT NOT NULL DEFAULT 'primary',
        backend_correlation_id TEXT,
        dispatch_token TEXT,
        error_message TEXT,
        content_id INTEGER REFERENCES content_items(id),
        created_at TEXT NOT NULL,
        started_at TEXT,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL REFERENCES users(id),
        title TEXT NOT NULL,
        message TEXT NOT NULL,
        kind TEXT NOT NULL,
        job_id INTEGER,
        content_id INTEGER,
        read INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS worker_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_name TEXT NOT NULL,
        args TEXT NOT NULL DEFAULT '{}',
        queue TEXT NOT NULL DEFAULT 'default',
        status TEXT NOT NULL DEFAULT 'queued',
        dispatch_token TEXT NOT NULL UNIQUE,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        not_before TEXT NOT NULL,
        soft_limit_secs INTEGER,
        hard_limit_secs INTEGER,
        claimed_by TEXT,
        last_error TEXT,
        created_at TEXT NOT NULL,
        claimed_at TEXT,
        finished_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS worker_heartbeats (
        worker_id TEXT PRIMARY KEY,
        hostname TEXT NOT NULL,
        pid INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        tasks_executed INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS route_analytics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        route TEXT NOT NULL,
        method TEXT NOT NULL,
        user_id TEXT,
        timestamp TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        status_code INTEGER NOT NULL,
        query_params TEXT NOT NULL DEFAULT '{}',
        query_params_normalized TEXT NOT NULL DEFAULT '{}',
        request_size_bytes INTEGER,
        response_size_bytes INTEGER,
        error_type TEXT,
        cache_status TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generation_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_type TEXT NOT NULL,
        generation_id INTEGER,
        user_id TEXT,
        timestamp TEXT NOT NULL,
        duration_ms INTEGER,
        success INTEGER,
        error_type TEXT,
        error_message TEXT,
        queue_wait_time_ms INTEGER,
        generation_time_ms INTEGER,
        model_checkpoint TEXT,
        image_dimensions TEXT,
        batch_size INTEGER,
        prompt_tokens INTEGER,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS route_analytics_hourly (
        timestamp TEXT NOT NULL,
        route TEXT NOT NULL,
        method TEXT NOT NULL,
        query_params_normalized TEXT NOT NULL,
        total_requests INTEGER NOT NULL DEFAULT 0,
        successful_requests INTEGER NOT NULL DEFAULT 0,
        client_errors INTEGER NOT NULL DEFAULT 0,
        server_errors INTEGER NOT NULL DEFAULT 0,
        avg_duration_ms INTEGER,
        p50_duration_ms INTEGER,
        p95_duration_ms INTEGER,
        p99_duration_ms INTEGER,
        unique_users INTEGER NOT NULL DEFAULT 0,
        avg_request_size_bytes INTEGER,
        avg_response_size_bytes INTEGER,
        cache_hits INTEGER NOT NULL DEFAULT 0,
        cache_misses INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        PRIMARY KEY (timestamp, route, method, query_params_normalized)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generation_metrics_hourly (
        timestamp TEXT PRIMARY KEY,
        total_requests INTEGER NOT NULL DEFAULT 0,
        successful_generations INTEGER NOT NULL DEFAULT 0,
        failed_generations INTEGER NOT NULL DEFAULT 0,
        cancelled_generations INTEGER NOT NULL DEFAULT 0,
        avg_duration_ms INTEGER,
        p50_duration_ms INTEGER,
        p95_duration_ms INTEGER,
        p99_duration_ms INTEGER,
        unique_users INTEGER NOT NULL DEFAULT 0,
        avg_queue_length INTEGER,
        max_queue_length INTEGER,
        total_images_generated INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_jobs_user ON generation_jobs(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON generation_jobs(status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_type ON generation_jobs(job_type)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_completed ON generation_jobs(completed_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON worker_tasks(status, queue, not_before)",
    "CREATE INDEX IF NOT EXISTS idx_route_analytics_ts ON route_analytics(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_generation_events_ts ON generation_events(timestamp)",
];

/// Create all tables and indexes if missing.
pub async fn ensure_schema(pool: &DbPool) -> Result<()> {
    for ddl in TABLES.iter().chain(INDEXES) {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
