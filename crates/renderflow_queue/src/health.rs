//! Worker-health probe and heartbeats.
//!
//! Workers upsert a heartbeat row on every loop cycle; the probe considers
//! the pool alive while at least one heartbeat is fresher than the staleness
//! window. The probe is best-effort: any error or timeout reads as "no
//! workers".

use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use renderflow_db::{DbPool, Result};

/// Workers are considered stale after this many seconds without heartbeat.
const WORKER_TIMEOUT_SECS: i64 = 60;

/// Probe query deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Pre-dispatch worker availability check.
pub enum WorkerHealthProbe {
    /// Live probe over the heartbeat table.
    Heartbeat(HeartbeatProbe),
    /// Fixed answer, used by tests in place of a live pool.
    Stub(bool),
}

impl WorkerHealthProbe {
    pub fn heartbeat(pool: DbPool) -> Self {
        Self::Heartbeat(HeartbeatProbe::new(pool))
    }

    pub fn stub(available: bool) -> Self {
        Self::Stub(available)
    }

    pub async fn workers_available(&self) -> bool {
        match self {
            WorkerHealthProbe::Stub(available) => *available,
            WorkerHealthProbe::Heartbeat(probe) => probe.check().await,
        }
    }
}

pub struct HeartbeatProbe {
    pool: DbPool,
    staleness_secs: i64,
}

impl HeartbeatProbe {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            staleness_secs: WORKER_TIMEOUT_SECS,
        }
    }

    /// True when at least one worker heartbeat is fresh. Errors and
    /// timeouts read as false.
    pub async fn check(&self) -> bool {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.staleness_secs);
        let query = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM worker_heartbeats WHERE last_seen >= ?",
        )
        .bind(cutoff)
        .fetch_one(&self.pool);

        match tokio::time::timeout(PROBE_TIMEOUT, query).await {
            Ok(Ok(count)) => count > 0,
            Ok(Err(e)) => {
                debug!("Worker health check failed: {e}");
                false
            }
            Err(_) => {
                debug!("Worker health check timed out");
                false
            }
        }
    }
}

/// Upsert this worker's heartbeat row.
pub async fn record_heartbeat(
    pool: &DbPool,
    worker_id: &str,
    hostname: &str,
    pid: i64,
    tasks_executed: i64,
) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO worker_heartbeats (worker_id, hostname, pid, started_at, last_seen, tasks_executed)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (worker_id) DO UPDATE SET
            last_seen = excluded.last_seen,
            tasks_executed = excluded.tasks_executed
        "#,
    )
    .bind(worker_id)
    .bind(hostname)
    .bind(pid)
    .bind(now)
    .bind(now)
    .bind(tasks_executed)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderflow_db::{create_pool, ensure_schema, DbConfig};

    #[tokio::test]
    async fn stub_probe_answers_directly() {
        assert!(WorkerHealthProbe::stub(true).workers_available().await);
        assert!(!WorkerHealthProbe::stub(false).workers_available().await);
    }

    #[tokio::test]
    async fn probe_sees_fresh_heartbeats_only() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let probe = WorkerHealthProbe::heartbeat(pool.clone());

        assert!(!probe.workers_available().await);

        record_heartbeat(&pool, "w1", "host", 42, 0).await.unwrap();
        assert!(probe.workers_available().await);

        // Age the heartbeat past the staleness window.
        let stale = Utc::now() - chrono::Duration::seconds(2 * WORKER_TIMEOUT_SECS);
        sqlx::query("UPDATE worker_heartbeats SET last_seen = ? WHERE worker_id = 'w1'")
            .bind(stale)
            .execute(&pool)
            .await
            .unwrap();
        assert!(!probe.workers_available().await);
    }

    #[tokio::test]
    async fn heartbeat_upsert_bumps_counters() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();

        record_heartbeat(&pool, "w1", "host", 42, 0).await.unwrap();
        record_heartbeat(&pool, "w1", "host", 42, 7).await.unwrap();

        let (count, executed): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), MAX(tasks_executed) FROM worker_heartbeats",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(executed, 7);
    }
}
