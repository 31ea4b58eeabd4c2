//! Hourly rollups.
//!
//! Both rollups aggregate the immediately preceding aligned hour (or the
//! hour before an explicit `reference_time`, for testability) and upsert on
//! the summary's natural key, so re-running is always safe. Percentiles are
//! continuous (linear interpolation), computed over the fetched window.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{error, info};

use renderflow_db::DbPool;

use crate::stats::{avg_int, percentile_cont_int};

/// Outcome of one rollup run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RollupReport {
    pub status: &'static str,
    pub rows_aggregated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RollupReport {
    fn success(rows_aggregated: usize) -> Self {
        Self {
            status: "success",
            rows_aggregated,
            error: None,
            timestamp: Utc::now(),
        }
    }

    fn failure(error: String) -> Self {
        Self {
            status: "error",
            rows_aggregated: 0,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }
}

/// Truncate to the containing UTC hour.
pub fn floor_to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    Utc.timestamp_opt(secs - secs.rem_euclid(3600), 0).single().unwrap_or(at)
}

/// `[floor(reference) - 1h, floor(reference))`.
fn target_window(reference_time: Option<DateTime<Utc>>) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = floor_to_hour(reference_time.unwrap_or_else(Utc::now));
    (end - Duration::hours(1), end)
}

// ============================================================================
// Route analytics rollup
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct RouteRawRow {
    route: String,
    method: String,
    query_params_normalized: String,
    user_id: Option<String>,
    duration_ms: i64,
    status_code: i64,
    request_size_bytes: Option<i64>,
    response_size_bytes: Option<i64>,
    cache_status: Option<String>,
}

#[derive(Default)]
struct RouteGroupAccumulator {
    durations: Vec<i64>,
    status_codes: Vec<i64>,
    users: Vec<String>,
    request_sizes: Vec<i64>,
    response_sizes: Vec<i64>,
    cache_hits: i64,
    cache_misses: i64,
}

/// Aggregate raw route analytics into `route_analytics_hourly`.
pub async fn aggregate_route_analytics_hourly(
    pool: &DbPool,
    reference_time: Option<DateTime<Utc>>,
) -> RollupReport {
    let (window_start, window_end) = target_window(reference_time);
    info!(
        "Aggregating route analytics for [{}, {})",
        window_start, window_end
    );

    let rows: Vec<RouteRawRow> = match sqlx::query_as(
        r#"
        SELECT route, method, query_params_normalized, user_id, duration_ms,
               status_code, request_size_bytes, response_size_bytes, cache_status
        FROM route_analytics
        WHERE timestamp >= ? AND timestamp < ?
        "#,
    )
    .bind(window_start)
    .bind(window_end)
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            error!("Failed to read route analytics window: {e}");
            return RollupReport::failure(e.to_string());
        }
    };

    let mut groups: BTreeMap<(String, String, String), RouteGroupAccumulator> = BTreeMap::new();
    for row in rows {
        let acc = groups
            .entry((
                row.route.clone(),
                row.method.clone(),
                row.query_params_normalized.clone(),
            ))
            .or_default();
        acc.durations.push(row.duration_ms);
        acc.status_codes.push(row.status_code);
        if let Some(user) = row.user_id {
            acc.users.push(user);
        }
        if let Some(size) = row.request_size_bytes {
            acc.request_sizes.push(size);
        }
        if let Some(size) = row.response_size_bytes {
            acc.response_sizes.push(size);
        }
        match row.cache_status.as_deref() {
            Some("hit") => acc.cache_hits += 1,
            Some("miss") => acc.cache_misses += 1,
            _ => {}
        }
    }

    let mut aggregated = 0usize;
    for ((route, method, normalized), acc) in groups {
        let total = acc.status_codes.len() as i64;
        let successful = acc
            .status_codes
            .iter()
            .filter(|code| (200..300).contains(*code))
            .count() as i64;
        let client_errors = acc
            .status_codes
            .iter()
            .filter(|code| (400..500).contains(*code))
            .count() as i64;
        let server_errors = acc.status_codes.iter().filter(|code| **code >= 500).count() as i64;

        let mut unique_users = acc.users.clone();
        unique_users.sort();
        unique_users.dedup();

        let result = sqlx::query(
            r#"
            INSERT INTO route_analytics_hourly (
                timestamp, route, method, query_params_normalized,
                total_requests, successful_requests, client_errors, server_errors,
                avg_duration_ms, p50_duration_ms, p95_duration_ms, p99_duration_ms,
                unique_users, avg_request_size_bytes, avg_response_size_bytes,
                cache_hits, cache_misses, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (timestamp, route, method, query_params_normalized) DO UPDATE SET
                total_requests = excluded.total_requests,
                successful_requests = excluded.successful_requests,
                client_errors = excluded.client_errors,
                server_errors = excluded.server_errors,
                avg_duration_ms = excluded.avg_duration_ms,
                p50_duration_ms = excluded.p50_duration_ms,
                p95_duration_ms = excluded.p95_duration_ms,
                p99_duration_ms = excluded.p99_duration_ms,
                unique_users = excluded.unique_users,
                avg_request_size_bytes = excluded.avg_request_size_bytes,
                avg_response_size_bytes = excluded.avg_response_size_bytes,
                cache_hits = excluded.cache_hits,
                cache_misses = excluded.cache_misses
            "#,
        )
        .bind(window_start)
        .bind(&route)
        .bind(&method)
        .bind(&normalized)
        .bind(total)
        .bind(successful)
        .bind(client_errors)
        .bind(server_errors)
        .bind(avg_int(&acc.durations))
        .bind(percentile_cont_int(&acc.durations, 0.50))
        .bind(percentile_cont_int(&acc.durations, 0.95))
        .bind(percentile_cont_int(&acc.durations, 0.99))
        .bind(unique_users.len() as i64)
        .bind(avg_int(&acc.request_sizes))
        .bind(avg_int(&acc.response_sizes))
        .bind(acc.cache_hits)
        .bind(acc.cache_misses)
        .bind(Utc::now())
        .execute(pool)
        .await;

        match result {
            Ok(_) => aggregated += 1,
            Err(e) => {
                error!("Failed to upsert hourly row for {method} {route}: {e}");
                return RollupReport::failure(e.to_string());
            }
        }
    }

    info!("Aggregated route analytics (rows affected: {aggregated})");
    RollupReport::success(aggregated)
}

// ============================================================================
// Generation metrics rollup
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct GenerationRawRow {
    event_type: String,
    user_id: Option<String>,
    duration_ms: Option<i64>,
    success: Option<bool>,
    batch_size: Option<i64>,
}

/// Aggregate raw generation events into `generation_metrics_hourly`.
pub async fn aggregate_generation_metrics_hourly(
    pool: &DbPool,
    reference_time: Option<DateTime<Utc>>,
) -> RollupReport {
    let (window_start, window_end) = target_window(reference_time);
    info!(
        "Aggregating generation metrics for [{}, {})",
        window_start, window_end
    );

    let rows: Vec<GenerationRawRow> = match sqlx::query_as(
        r#"
        SELECT event_type, user_id, duration_ms, success, batch_size
        FROM generation_events
        WHERE timestamp >= ? AND timestamp < ?
        "#,
    )
    .bind(window_start)
    .bind(window_end)
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            error!("Failed to read generation events window: {e}");
            return RollupReport::failure(e.to_string());
        }
    };

    if rows.is_empty() {
        info!("No generation events in window");
        return RollupReport::success(0);
    }

    let total_requests = rows.iter().filter(|r| r.event_type == "request").count() as i64;
    let successful = rows
        .iter()
        .filter(|r| r.event_type == "completion" && r.success == Some(true))
        .count() as i64;
    let failed = rows
        .iter()
        .filter(|r| r.event_type == "completion" && r.success == Some(false))
        .count() as i64;
    let cancelled = rows
        .iter()
        .filter(|r| r.event_type == "cancellation")
        .count() as i64;

    // Durations exist only on completion events.
    let completion_durations: Vec<i64> = rows
        .iter()
        .filter(|r| r.event_type == "completion")
        .filter_map(|r| r.duration_ms)
        .collect();

    let mut unique_users: Vec<&String> = rows.iter().filter_map(|r| r.user_id.as_ref()).collect();
    unique_users.sort();
    unique_users.dedup();

    let total_images: i64 = rows
        .iter()
        .filter(|r| r.event_type == "completion" && r.success == Some(true))
        .map(|r| r.batch_size.unwrap_or(1))
        .sum();

    let result = sqlx::query(
        r#"
        INSERT INTO generation_metrics_hourly (
            timestamp,
            total_requests, successful_generations, failed_generations, cancelled_generations,
            avg_duration_ms, p50_duration_ms, p95_duration_ms, p99_duration_ms,
            unique_users, avg_queue_length, max_queue_length,
            total_images_generated, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)
        ON CONFLICT (timestamp) DO UPDATE SET
            total_requests = excluded.total_requests,
            successful_generations = excluded.successful_generations,
            failed_generations = excluded.failed_generations,
            cancelled_generations = excluded.cancelled_generations,
            avg_duration_ms = excluded.avg_duration_ms,
            p50_duration_ms = excluded.p50_duration_ms,
            p95_duration_ms = excluded.p95_duration_ms,
            p99_duration_ms = excluded.p99_duration_ms,
            unique_users = excluded.unique_users,
            total_images_generated = excluded.total_images_generated
        "#,
    )
    .bind(window_start)
    .bind(total_requests)
    .bind(successful)
    .bind(failed)
    .bind(cancelled)
    .bind(avg_int(&completion_durations))
    .bind(percentile_cont_int(&completion_durations, 0.50))
    .bind(percentile_cont_int(&completion_durations, 0.95))
    .bind(percentile_cont_int(&completion_durations, 0.99))
    .bind(unique_users.len() as i64)
    .bind(total_images)
    .bind(Utc::now())
    .execute(pool)
    .await;

    match result {
        Ok(_) => {
            info!("Aggregated generation metrics for {window_start}");
            RollupReport::success(1)
        }
        Err(e) => {
            error!("Failed to upsert generation metrics: {e}");
            RollupReport::failure(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderflow_db::{create_pool, ensure_schema, DbConfig};

    async fn setup() -> DbPool {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        pool
    }

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap()
    }

    async fn seed_route_event(
        pool: &DbPool,
        at: DateTime<Utc>,
        duration_ms: i64,
        status: i64,
        user_id: Option<&str>,
        normalized: &str,
    ) {
        sqlx::query(
            r#"
            INSERT INTO route_analytics (
                route, method, user_id, timestamp, duration_ms, status_code,
                query_params, query_params_normalized, created_at
            ) VALUES ('/api/v1/content/unified', 'GET', ?, ?, ?, ?, '{}', ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(at)
        .bind(duration_ms)
        .bind(status)
        .bind(normalized)
        .bind(at)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn route_rollup_computes_percentiles_and_counts() {
        let pool = setup().await;
        let normalized = r#"{"page_size":"10","sort":"created_at"}"#;
        seed_route_event(&pool, hour(10) + Duration::minutes(0), 100, 200, None, normalized).await;
        seed_route_event(&pool, hour(10) + Duration::minutes(5), 500, 200, None, normalized).await;
        seed_route_event(&pool, hour(10) + Duration::minutes(10), 450, 200, None, normalized).await;
        // Outside the window.
        seed_route_event(&pool, hour(11) + Duration::minutes(1), 9000, 200, None, normalized).await;

        let report = aggregate_route_analytics_hourly(&pool, Some(hour(11))).await;
        assert_eq!(report.status, "success");
        assert_eq!(report.rows_aggregated, 1);

        let (total, successful, p95, unique): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT total_requests, successful_requests, p95_duration_ms, unique_users
            FROM route_analytics_hourly
            WHERE route = '/api/v1/content/unified'
            "#,
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(total, 3);
        assert_eq!(successful, 3);
        assert_eq!(p95, 495); // continuous percentile over [100, 450, 500]
        assert_eq!(unique, 0); // no user ids recorded
    }

    #[tokio::test]
    async fn route_rollup_is_idempotent() {
        let pool = setup().await;
        seed_route_event(&pool, hour(10), 100, 200, Some("u-1"), "{}").await;
        seed_route_event(&pool, hour(10), 300, 404, Some("u-2"), "{}").await;

        let first = aggregate_route_analytics_hourly(&pool, Some(hour(11))).await;
        let second = aggregate_route_analytics_hourly(&pool, Some(hour(11))).await;
        assert_eq!(first.rows_aggregated, 1);
        assert_eq!(second.rows_aggregated, 1);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM route_analytics_hourly")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let (client_errors, unique): (i64, i64) = sqlx::query_as(
            "SELECT client_errors, unique_users FROM route_analytics_hourly",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(client_errors, 1);
        assert_eq!(unique, 2);
    }

    #[tokio::test]
    async fn route_rollup_separates_normalized_groups() {
        let pool = setup().await;
        seed_route_event(&pool, hour(10), 100, 200, None, r#"{"sort":"a"}"#).await;
        seed_route_event(&pool, hour(10), 100, 200, None, r#"{"sort":"b"}"#).await;

        let report = aggregate_route_analytics_hourly(&pool, Some(hour(11))).await;
        assert_eq!(report.rows_aggregated, 2);
    }

    async fn seed_generation_event(
        pool: &DbPool,
        at: DateTime<Utc>,
        event_type: &str,
        success: Option<bool>,
        duration_ms: Option<i64>,
        batch_size: Option<i64>,
        user_id: &str,
    ) {
        sqlx::query(
            r#"
            INSERT INTO generation_events (
                event_type, generation_id, user_id, timestamp, duration_ms,
                success, batch_size, created_at
            ) VALUES (?, 1, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event_type)
        .bind(user_id)
        .bind(at)
        .bind(duration_ms)
        .bind(success)
        .bind(batch_size)
        .bind(at)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn generation_rollup_counts_by_event_kind() {
        let pool = setup().await;
        let at = hour(10) + Duration::minutes(15);
        seed_generation_event(&pool, at, "request", None, None, None, "u-1").await;
        seed_generation_event(&pool, at, "request", None, None, None, "u-2").await;
        seed_generation_event(&pool, at, "completion", Some(true), Some(4000), Some(2), "u-1").await;
        seed_generation_event(&pool, at, "completion", Some(true), Some(6000), None, "u-2").await;
        seed_generation_event(&pool, at, "completion", Some(false), Some(1000), Some(4), "u-1").await;
        seed_generation_event(&pool, at, "cancellation", None, None, None, "u-3").await;

        let report = aggregate_generation_metrics_hourly(&pool, Some(hour(11))).await;
        assert_eq!(report.status, "success");
        assert_eq!(report.rows_aggregated, 1);

        let row: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT total_requests, successful_generations, failed_generations,
                   cancelled_generations, unique_users, total_images_generated,
                   p50_duration_ms
            FROM generation_metrics_hourly
            "#,
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(row.0, 2); // requests
        assert_eq!(row.1, 2); // successes
        assert_eq!(row.2, 1); // failures
        assert_eq!(row.3, 1); // cancellations
        assert_eq!(row.4, 3); // unique users
        // Images: batch 2 + default 1 for the missing batch size.
        assert_eq!(row.5, 3);
        // Median over completion durations [1000, 4000, 6000].
        assert_eq!(row.6, 4000);

        // Idempotent re-run keeps a single row.
        aggregate_generation_metrics_hourly(&pool, Some(hour(11))).await;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM generation_metrics_hourly")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn window_math_floors_to_the_hour() {
        let reference = Utc.with_ymd_and_hms(2026, 3, 1, 11, 42, 17).unwrap();
        let (start, end) = target_window(Some(reference));
        assert_eq!(start, hour(10));
        assert_eq!(end, hour(11));
    }
}
