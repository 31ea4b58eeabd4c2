//! Analytics REST surfaces: cache priorities, performance trends, peak
//! hours. Read-only views over the hourly summary tables.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use renderflow_analytics::{
    peak_hours, performance_trends, top_routes_absolute, top_routes_relative, AbsoluteParams,
    Granularity,
};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/analytics/routes/cache-priorities", get(cache_priorities))
        .route(
            "/api/v1/analytics/routes/performance-trends",
            get(performance_trends_route),
        )
        .route("/api/v1/analytics/routes/peak-hours", get(peak_hours_route))
}

fn unprocessable(detail: impl Into<String>) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "detail": detail.into() })),
    )
        .into_response()
}

fn internal(detail: impl Into<String>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": detail.into() })),
    )
        .into_response()
}

// ----------------------------------------------------------------------
// GET /api/v1/analytics/routes/cache-priorities
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CachePrioritiesQuery {
    #[serde(default = "default_n")]
    n: i64,
    #[serde(default = "default_days")]
    days: i64,
    #[serde(default = "default_system")]
    system: String,
    #[serde(default = "default_min_requests")]
    min_requests: i64,
    #[serde(default = "default_min_latency")]
    min_latency: i64,
}

fn default_n() -> i64 {
    10
}
fn default_days() -> i64 {
    7
}
fn default_system() -> String {
    "absolute".to_string()
}
fn default_min_requests() -> i64 {
    10
}
fn default_min_latency() -> i64 {
    100
}

async fn cache_priorities(
    State(state): State<AppState>,
    Query(query): Query<CachePrioritiesQuery>,
) -> Response {
    if !(1..=100).contains(&query.n) {
        return unprocessable("n must be between 1 and 100");
    }
    if !(1..=90).contains(&query.days) {
        return unprocessable("days must be between 1 and 90");
    }
    if query.min_requests < 0 || query.min_latency < 0 {
        return unprocessable("thresholds must be non-negative");
    }

    let routes = match query.system.as_str() {
        "absolute" => {
            top_routes_absolute(
                &state.pool,
                query.n as usize,
                query.days,
                AbsoluteParams {
                    min_requests_per_hour: query.min_requests as f64,
                    min_latency_ms: query.min_latency as f64,
                },
            )
            .await
        }
        "relative" => top_routes_relative(&state.pool, query.n as usize, query.days).await,
        other => {
            return unprocessable(format!(
                "system must be 'absolute' or 'relative', got '{other}'"
            ))
        }
    };

    match routes {
        Ok(routes) => Json(json!({
            "system": query.system,
            "lookback_days": query.days,
            "total_routes": routes.len(),
            "routes": routes,
        }))
        .into_response(),
        Err(e) => {
            error!("Cache priority analysis failed: {e}");
            internal(format!("Failed to analyze cache priorities: {e}"))
        }
    }
}

// ----------------------------------------------------------------------
// GET /api/v1/analytics/routes/performance-trends
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PerformanceTrendsQuery {
    route: Option<String>,
    #[serde(default = "default_days")]
    days: i64,
    #[serde(default = "default_granularity")]
    granularity: String,
}

fn default_granularity() -> String {
    "hourly".to_string()
}

async fn performance_trends_route(
    State(state): State<AppState>,
    Query(query): Query<PerformanceTrendsQuery>,
) -> Response {
    let Some(route) = query.route.filter(|r| !r.is_empty()) else {
        return unprocessable("route is required");
    };
    if !(1..=90).contains(&query.days) {
        return unprocessable("days must be between 1 and 90");
    }
    let granularity: Granularity = match query.granularity.parse() {
        Ok(granularity) => granularity,
        Err(e) => return unprocessable(e),
    };

    match performance_trends(&state.pool, &route, query.days, granularity).await {
        Ok(trends) => Json(json!({
            "route": route,
            "granularity": granularity.as_str(),
            "lookback_days": query.days,
            "data_points": trends.len(),
            "trends": trends,
        }))
        .into_response(),
        Err(e) => {
            error!("Performance trends query failed: {e}");
            internal(format!("Failed to get performance trends: {e}"))
        }
    }
}

// ----------------------------------------------------------------------
// GET /api/v1/analytics/routes/peak-hours
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PeakHoursQuery {
    route: Option<String>,
    #[serde(default = "default_peak_days")]
    days: i64,
    #[serde(default = "default_peak_min_requests")]
    min_requests: i64,
}

fn default_peak_days() -> i64 {
    30
}
fn default_peak_min_requests() -> i64 {
    50
}

async fn peak_hours_route(
    State(state): State<AppState>,
    Query(query): Query<PeakHoursQuery>,
) -> Response {
    if !(7..=90).contains(&query.days) {
        return unprocessable("days must be between 7 and 90");
    }
    if query.min_requests < 1 {
        return unprocessable("min_requests must be at least 1");
    }

    match peak_hours(&state.pool, query.route.as_deref(), query.days, query.min_requests).await {
        Ok(patterns) => Json(json!({
            "route": query.route,
            "lookback_days": query.days,
            "min_requests_threshold": query.min_requests,
            "total_patterns": patterns.len(),
            "peak_hours": patterns,
        }))
        .into_response(),
        Err(e) => {
            error!("Peak hours query failed: {e}");
            internal(format!("Failed to analyze peak hours: {e}"))
        }
    }
}
