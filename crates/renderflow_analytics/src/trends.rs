//! Trend and peak-hour queries over the hourly summaries.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Serialize;

use renderflow_db::DbPool;

use crate::stats::avg_int;

/// Time-series granularity for performance trends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hourly,
    Daily,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Granularity::Hourly),
            "daily" => Ok(Granularity::Daily),
            _ => Err(format!("Invalid granularity: '{}'", s)),
        }
    }
}

/// One point of the performance-trends series.
#[derive(Debug, Clone, Serialize)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub client_errors: i64,
    pub server_errors: i64,
    pub avg_duration_ms: Option<i64>,
    pub p50_duration_ms: Option<i64>,
    pub p95_duration_ms: Option<i64>,
    pub p99_duration_ms: Option<i64>,
    pub unique_users: Option<i64>,
    pub success_rate: Option<f64>,
}

#[derive(Debug, sqlx::FromRow)]
struct HourlyRow {
    timestamp: DateTime<Utc>,
    total_requests: i64,
    successful_requests: i64,
    client_errors: i64,
    server_errors: i64,
    avg_duration_ms: Option<i64>,
    p50_duration_ms: Option<i64>,
    p95_duration_ms: Option<i64>,
    p99_duration_ms: Option<i64>,
    unique_users: i64,
}

impl HourlyRow {
    fn into_point(self) -> TrendPoint {
        let success_rate = if self.total_requests > 0 {
            Some(self.successful_requests as f64 / self.total_requests as f64)
        } else {
            None
        };
        TrendPoint {
            timestamp: self.timestamp,
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            client_errors: self.client_errors,
            server_errors: self.server_errors,
            avg_duration_ms: self.avg_duration_ms,
            p50_duration_ms: self.p50_duration_ms,
            p95_duration_ms: self.p95_duration_ms,
            p99_duration_ms: self.p99_duration_ms,
            unique_users: Some(self.unique_users),
            success_rate,
        }
    }
}

/// Performance trend for one route.
///
/// Hourly: rolling `NOW - days` window, one point per summary row.
/// Daily: exactly `days` calendar-UTC buckets ending today, zero-filled for
/// days without traffic.
pub async fn performance_trends(
    pool: &DbPool,
    route: &str,
    days: i64,
    granularity: Granularity,
) -> Result<Vec<TrendPoint>, sqlx::Error> {
    match granularity {
        Granularity::Hourly => {
            let cutoff = Utc::now() - Duration::days(days);
            let rows: Vec<HourlyRow> = sqlx::query_as(
                r#"
                SELECT timestamp, total_requests, successful_requests, client_errors,
                       server_errors, avg_duration_ms, p50_duration_ms, p95_duration_ms,
                       p99_duration_ms, unique_users
                FROM route_analytics_hourly
                WHERE route = ? AND timestamp > ?
                ORDER BY timestamp ASC
                "#,
            )
            .bind(route)
            .bind(cutoff)
            .fetch_all(pool)
            .await?;
            Ok(rows.into_iter().map(HourlyRow::into_point).collect())
        }
        Granularity::Daily => {
            // Calendar-day alignment: (days - 1) back from today's UTC
            // midnight, so the series covers exactly `days` days incl. today.
            let today = Utc::now()
                .date_naive()
                .and_time(NaiveTime::MIN)
                .and_utc();
            let window_start = today - Duration::days(days - 1);

            let rows: Vec<HourlyRow> = sqlx::query_as(
                r#"
                SELECT timestamp, total_requests, successful_requests, client_errors,
                       server_errors, avg_duration_ms, p50_duration_ms, p95_duration_ms,
                       p99_duration_ms, unique_users
                FROM route_analytics_hourly
                WHERE route = ? AND timestamp >= ?
                ORDER BY timestamp ASC
                "#,
            )
            .bind(route)
            .bind(window_start)
            .fetch_all(pool)
            .await?;

            let mut points = Vec::with_capacity(days as usize);
            for day_index in 0..days {
                let day_start = window_start + Duration::days(day_index);
                let day_end = day_start + Duration::days(1);
                let bucket: Vec<&HourlyRow> = rows
                    .iter()
                    .filter(|row| row.timestamp >= day_start && row.timestamp < day_end)
                    .collect();

                let total: i64 = bucket.iter().map(|r| r.total_requests).sum();
                let successful: i64 = bucket.iter().map(|r| r.successful_requests).sum();
                let avg_of = |extract: fn(&HourlyRow) -> Option<i64>| {
                    let values: Vec<i64> = bucket.iter().filter_map(|r| extract(r)).collect();
                    avg_int(&values)
                };

                points.push(TrendPoint {
                    timestamp: day_start,
                    total_requests: total,
                    successful_requests: successful,
                    client_errors: bucket.iter().map(|r| r.client_errors).sum(),
                    server_errors: bucket.iter().map(|r| r.server_errors).sum(),
                    avg_duration_ms: avg_of(|r| r.avg_duration_ms),
                    p50_duration_ms: avg_of(|r| r.p50_duration_ms),
                    p95_duration_ms: avg_of(|r| r.p95_duration_ms),
                    p99_duration_ms: avg_of(|r| r.p99_duration_ms),
                    unique_users: avg_of(|r| Some(r.unique_users)),
                    success_rate: if total > 0 {
                        Some(successful as f64 / total as f64)
                    } else {
                        None
                    },
                });
            }
            Ok(points)
        }
    }
}

/// One (route, hour-of-day) traffic pattern.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PeakHour {
    pub route: String,
    pub hour_of_day: i64,
    pub avg_requests: f64,
    pub avg_p95_latency_ms: Option<f64>,
    pub avg_unique_users: Option<f64>,
    pub data_points: i64,
}

/// Peak traffic hours, grouped by hour of day over the lookback window.
/// Without a route filter, routes below `min_requests` average are dropped.
pub async fn peak_hours(
    pool: &DbPool,
    route: Option<&str>,
    days: i64,
    min_requests: i64,
) -> Result<Vec<PeakHour>, sqlx::Error> {
    let cutoff = Utc::now() - Duration::days(days);

    let rows: Vec<PeakHour> = match route {
        Some(route) => {
            sqlx::query_as(
                r#"
                SELECT
                    route,
                    CAST(strftime('%H', timestamp) AS INTEGER) as hour_of_day,
                    AVG(total_requests) as avg_requests,
                    AVG(p95_duration_ms) as avg_p95_latency_ms,
                    AVG(unique_users) as avg_unique_users,
                    COUNT(*) as data_points
                FROM route_analytics_hourly
                WHERE route = ? AND timestamp > ?
                GROUP BY route, hour_of_day
                ORDER BY avg_requests DESC
                "#,
            )
            .bind(route)
            .bind(cutoff)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as(
                r#"
                SELECT
                    route,
                    CAST(strftime('%H', timestamp) AS INTEGER) as hour_of_day,
                    AVG(total_requests) as avg_requests,
                    AVG(p95_duration_ms) as avg_p95_latency_ms,
                    AVG(unique_users) as avg_unique_users,
                    COUNT(*) as data_points
                FROM route_analytics_hourly
                WHERE timestamp > ?
                GROUP BY route, hour_of_day
                HAVING AVG(total_requests) >= ?
                ORDER BY route, avg_requests DESC
                "#,
            )
            .bind(cutoff)
            .bind(min_requests)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderflow_db::{create_pool, ensure_schema, DbConfig};

    async fn seed(pool: &DbPool, route: &str, at: DateTime<Utc>, total: i64, p95: i64) {
        sqlx::query(
            r#"
            INSERT INTO route_analytics_hourly (
                timestamp, route, method, query_params_normalized,
                total_requests, successful_requests, client_errors, server_errors,
                avg_duration_ms, p50_duration_ms, p95_duration_ms, p99_duration_ms,
                unique_users, created_at
            ) VALUES (?, ?, 'GET', '{}', ?, ?, 0, 0, ?, ?, ?, ?, 3, ?)
            "#,
        )
        .bind(at)
        .bind(route)
        .bind(total)
        .bind(total)
        .bind(p95 / 2)
        .bind(p95 / 2)
        .bind(p95)
        .bind(p95 + 20)
        .bind(at)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn hourly_trends_order_by_time() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();

        let now = Utc::now();
        seed(&pool, "/api/v1/content/unified", now - Duration::hours(3), 10, 200).await;
        seed(&pool, "/api/v1/content/unified", now - Duration::hours(1), 20, 100).await;
        seed(&pool, "/other", now - Duration::hours(2), 99, 999).await;

        let points = performance_trends(&pool, "/api/v1/content/unified", 7, Granularity::Hourly)
            .await
            .unwrap();
        assert_eq!(points.len(), 2);
        assert!(points[0].timestamp < points[1].timestamp);
        assert_eq!(points[1].total_requests, 20);
        assert_eq!(points[1].success_rate, Some(1.0));
    }

    #[tokio::test]
    async fn daily_trends_return_exactly_days_buckets() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();

        let now = Utc::now();
        seed(&pool, "/r", now - Duration::days(1), 24, 100).await;
        seed(&pool, "/r", now - Duration::days(1) + Duration::hours(1), 26, 300).await;

        let points = performance_trends(&pool, "/r", 7, Granularity::Daily).await.unwrap();
        assert_eq!(points.len(), 7);
        // Buckets are aligned to UTC midnights, one day apart.
        for pair in points.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, Duration::days(1));
            assert_eq!(pair[0].timestamp.time(), NaiveTime::MIN);
        }
        // Empty days are zero-filled.
        assert_eq!(points[0].total_requests, 0);
        assert!(points[0].success_rate.is_none());
        // The seeded day sums its hourly rows.
        let busy: Vec<&TrendPoint> = points.iter().filter(|p| p.total_requests > 0).collect();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].total_requests, 50);
        assert_eq!(busy[0].p95_duration_ms, Some(200));
    }

    #[tokio::test]
    async fn peak_hours_group_by_hour_of_day() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();

        let midnight = Utc::now()
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc();
        // Two days of traffic at 09:00, one at 17:00.
        seed(&pool, "/r", midnight - Duration::days(1) + Duration::hours(9), 100, 100).await;
        seed(&pool, "/r", midnight - Duration::days(2) + Duration::hours(9), 200, 100).await;
        seed(&pool, "/r", midnight - Duration::days(1) + Duration::hours(17), 30, 100).await;

        let rows = peak_hours(&pool, Some("/r"), 7, 1).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].hour_of_day, 9);
        assert_eq!(rows[0].avg_requests, 150.0);
        assert_eq!(rows[0].data_points, 2);
        assert_eq!(rows[1].hour_of_day, 17);
    }

    #[tokio::test]
    async fn peak_hours_threshold_filters_quiet_routes() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let now = Utc::now();
        seed(&pool, "/busy", now - Duration::hours(2), 500, 100).await;
        seed(&pool, "/quiet", now - Duration::hours(2), 2, 100).await;

        let rows = peak_hours(&pool, None, 7, 50).await.unwrap();
        assert!(rows.iter().all(|r| r.route == "/busy"));
    }
}
