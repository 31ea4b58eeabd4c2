//! Cache priority scoring over the hourly route summaries.
//!
//! Two independent systems: absolute thresholds (production traffic) and
//! percentile-relative ranking (works on sparse development traffic). Both
//! read the same grouped aggregate over a lookback window.

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::info;

use renderflow_db::DbPool;

use crate::stats::percentile_rank;

/// Thresholds for the absolute system.
#[derive(Debug, Clone, Copy)]
pub struct AbsoluteParams {
    pub min_requests_per_hour: f64,
    pub min_latency_ms: f64,
}

impl Default for AbsoluteParams {
    fn default() -> Self {
        Self {
            min_requests_per_hour: 10.0,
            min_latency_ms: 100.0,
        }
    }
}

/// One scored fingerprint. Raw metrics always present; score fields depend
/// on the system that produced the row.
#[derive(Debug, Clone, Serialize)]
pub struct RouteCachePriority {
    pub route: String,
    pub method: String,
    /// Normalized query params as stored (JSON text).
    pub query_params_normalized: String,
    pub avg_hourly_requests: f64,
    pub avg_p95_latency_ms: f64,
    pub avg_p99_latency_ms: f64,
    pub avg_unique_users: f64,
    pub total_requests: i64,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_priority_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popularity_percentile: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_percentile: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_percentile: Option<f64>,
}

#[derive(Debug, sqlx::FromRow)]
struct GroupRow {
    route: String,
    method: String,
    query_params_normalized: String,
    avg_hourly_requests: f64,
    avg_p95_latency: Option<f64>,
    avg_p99_latency: Option<f64>,
    avg_unique_users: f64,
    total_requests: i64,
    success_rate: Option<f64>,
}

impl GroupRow {
    fn into_priority(self) -> RouteCachePriority {
        RouteCachePriority {
            route: self.route,
            method: self.method,
            query_params_normalized: self.query_params_normalized,
            avg_hourly_requests: self.avg_hourly_requests,
            avg_p95_latency_ms: self.avg_p95_latency.unwrap_or(0.0),
            avg_p99_latency_ms: self.avg_p99_latency.unwrap_or(0.0),
            avg_unique_users: self.avg_unique_users,
            total_requests: self.total_requests,
            success_rate: self.success_rate.unwrap_or(0.0),
            cache_priority_score: None,
            priority_score: None,
            popularity_percentile: None,
            latency_percentile: None,
            user_percentile: None,
        }
    }
}

async fn fetch_groups(
    pool: &DbPool,
    lookback_days: i64,
    having: &str,
    limit: Option<i64>,
) -> Result<Vec<GroupRow>, sqlx::Error> {
    let cutoff = Utc::now() - Duration::days(lookback_days);
    let mut sql = String::from(
        r#"
        SELECT
            route,
            method,
            query_params_normalized,
            AVG(total_requests) as avg_hourly_requests,
            AVG(p95_duration_ms) as avg_p95_latency,
            AVG(p99_duration_ms) as avg_p99_latency,
            AVG(unique_users) as avg_unique_users,
            CAST(SUM(total_requests) AS INTEGER) as total_requests,
            AVG(CAST(successful_requests AS REAL) / NULLIF(total_requests, 0)) as success_rate
        FROM route_analytics_hourly
        WHERE timestamp > ?
        GROUP BY route, method, query_params_normalized
        "#,
    );
    sql.push_str(having);
    sql.push_str(" ORDER BY AVG(total_requests) * AVG(p95_duration_ms) DESC");
    if limit.is_some() {
        sql.push_str(" LIMIT ?");
    }

    let mut query = sqlx::query_as::<_, GroupRow>(&sql).bind(cutoff);
    if let Some(limit) = limit {
        query = query.bind(limit);
    }
    query.fetch_all(pool).await
}

/// System 1: absolute thresholds.
///
/// `score = avg_requests*10 + avg_p95/100 + min(avg_users/10, 10)`, ranked
/// descending over the groups passing both minimums.
pub async fn top_routes_absolute(
    pool: &DbPool,
    n: usize,
    lookback_days: i64,
    params: AbsoluteParams,
) -> Result<Vec<RouteCachePriority>, sqlx::Error> {
    let having = format!(
        " HAVING AVG(total_requests) >= {} AND AVG(p95_duration_ms) >= {}",
        params.min_requests_per_hour, params.min_latency_ms
    );
    // Over-fetch, then rank by the composite score.
    let rows = fetch_groups(pool, lookback_days, &having, Some((n * 2) as i64)).await?;

    let mut routes: Vec<RouteCachePriority> = rows
        .into_iter()
        .map(|row| {
            let mut priority = row.into_priority();
            priority.cache_priority_score = Some(absolute_score(
                priority.avg_hourly_requests,
                priority.avg_p95_latency_ms,
                priority.avg_unique_users,
            ));
            priority
        })
        .collect();

    routes.sort_by(|a, b| {
        b.cache_priority_score
            .partial_cmp(&a.cache_priority_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    routes.truncate(n);
    info!("Absolute cache analysis produced {} routes", routes.len());
    Ok(routes)
}

/// Cache priority score for one fingerprint (absolute system).
pub fn absolute_score(avg_requests: f64, avg_p95_latency: f64, avg_unique_users: f64) -> f64 {
    let frequency_score = avg_requests * 10.0;
    let latency_score = avg_p95_latency / 100.0;
    let user_diversity_score = (avg_unique_users / 10.0).min(10.0);
    frequency_score + latency_score + user_diversity_score
}

/// System 2: percentile-relative ranking, no absolute thresholds.
///
/// `priority = 0.4*latency_pct + 0.4*popularity_pct + 0.2*user_pct`.
pub async fn top_routes_relative(
    pool: &DbPool,
    n: usize,
    lookback_days: i64,
) -> Result<Vec<RouteCachePriority>, sqlx::Error> {
    let rows = fetch_groups(pool, lookback_days, " HAVING AVG(total_requests) > 0", None).await?;

    let mut routes: Vec<RouteCachePriority> =
        rows.into_iter().map(GroupRow::into_priority).collect();

    let request_dist: Vec<f64> = routes.iter().map(|r| r.avg_hourly_requests).collect();
    let latency_dist: Vec<f64> = routes.iter().map(|r| r.avg_p95_latency_ms).collect();
    let user_dist: Vec<f64> = routes.iter().map(|r| r.avg_unique_users).collect();

    for route in &mut routes {
        let popularity = percentile_rank(route.avg_hourly_requests, &request_dist);
        let latency = percentile_rank(route.avg_p95_latency_ms, &latency_dist);
        let users = percentile_rank(route.avg_unique_users, &user_dist);
        route.popularity_percentile = Some(popularity);
        route.latency_percentile = Some(latency);
        route.user_percentile = Some(users);
        route.priority_score = Some(0.4 * latency + 0.4 * popularity + 0.2 * users);
    }

    // Stable sort keeps a deterministic tie-break.
    routes.sort_by(|a, b| {
        b.priority_score
            .partial_cmp(&a.priority_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    routes.truncate(n);
    info!("Relative cache analysis produced {} routes", routes.len());
    Ok(routes)
}
