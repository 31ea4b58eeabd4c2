//! Route-analytics capture middleware.
//!
//! Records one event per `/api/` request. Never fails a request: the sink is
//! infallible past the startup probe and everything else is measured off the
//! request/response that already exist.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use renderflow_analytics::RouteRequestRecord;

use crate::state::AppState;

const TRACK_PATH_PREFIX: &str = "/api/";

pub async fn capture_route_analytics(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if !path.starts_with(TRACK_PATH_PREFIX) || !state.capture.is_enabled() {
        return next.run(request).await;
    }

    let started = Instant::now();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let method = request.method().to_string();
    let query_string = request.uri().query().unwrap_or("").to_string();
    let request_size = content_length(request.headers());
    let user_id = user_id_from_headers(request.headers());

    let response = next.run(request).await;

    let record = RouteRequestRecord {
        route: path,
        method,
        query_string,
        user_id,
        status_code: response.status().as_u16(),
        duration_ms: started.elapsed().as_millis() as i64,
        request_size_bytes: request_size,
        response_size_bytes: content_length(response.headers()),
        timestamp,
    };
    state.capture.record(&record);

    response
}

fn content_length(headers: &HeaderMap) -> i64 {
    headers
        .get("content-length")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// User id comes from the auth layer when present; the `X-User-ID` header is
/// the testing fallback.
fn user_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .filter(|raw| !raw.is_empty())
        .map(str::to_string)
}
