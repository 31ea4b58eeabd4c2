//! Analytics round-trip: capture -> transfer -> rollup -> analyzers.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{Map, Value};

use renderflow_analytics::{
    aggregate_route_analytics_hourly, transfer_route_analytics, RouteAnalyticsCapture,
    RouteRequestRecord,
};
use renderflow_events::EventBuffer;
use renderflow_test_utils::test_pool;

const NAMESPACE: &str = "renderflow_test";

fn request_at(epoch_secs: f64, duration_ms: i64) -> RouteRequestRecord {
    RouteRequestRecord {
        route: "/api/v1/content/unified".to_string(),
        method: "GET".to_string(),
        query_string: "page=2&page_size=10&sort=created_at".to_string(),
        user_id: None,
        status_code: 200,
        duration_ms,
        request_size_bytes: 0,
        response_size_bytes: 1024,
        timestamp: epoch_secs,
    }
}

#[tokio::test]
async fn capture_transfer_rollup_roundtrip() {
    let pool = test_pool().await;
    let buffer = Arc::new(EventBuffer::new());
    let capture = RouteAnalyticsCapture::new(buffer.clone(), NAMESPACE);

    // Three GETs inside the same UTC hour H, durations 100/500/450 ms.
    let hour = Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 0).unwrap();
    let base = hour.timestamp() as f64;
    capture.record(&request_at(base, 100));
    capture.record(&request_at(base + 300.0, 500));
    capture.record(&request_at(base + 600.0, 450));

    let transfer = transfer_route_analytics(&pool, &buffer, NAMESPACE).await;
    assert_eq!(transfer.status, "success");
    assert_eq!(transfer.events_transferred, 3);

    // Rollup for the hour after H aggregates [H, H+1).
    let rollup = aggregate_route_analytics_hourly(&pool, Some(hour + chrono::Duration::hours(1)))
        .await;
    assert_eq!(rollup.status, "success");
    assert_eq!(rollup.rows_aggregated, 1);

    let row: (String, String, String, i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT route, method, query_params_normalized, total_requests,
               successful_requests, p95_duration_ms, unique_users
        FROM route_analytics_hourly
        "#,
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(row.0, "/api/v1/content/unified");
    assert_eq!(row.1, "GET");
    assert_eq!(row.3, 3);
    assert_eq!(row.4, 3);
    // Continuous p95 over [100, 450, 500].
    assert_eq!(row.5, 495);
    // No user header was set on any request.
    assert_eq!(row.6, 0);

    // The grouping key keeps only the non-pagination params.
    let normalized: Map<String, Value> = serde_json::from_str(&row.2).unwrap();
    assert_eq!(normalized.len(), 2);
    assert_eq!(normalized["page_size"], "10");
    assert_eq!(normalized["sort"], "created_at");

    // Re-running the whole pipeline is safe: the transfer re-reads (adding
    // tolerated duplicates) and the rollup upsert keeps one summary row.
    transfer_route_analytics(&pool, &buffer, NAMESPACE).await;
    aggregate_route_analytics_hourly(&pool, Some(hour + chrono::Duration::hours(1))).await;
    let summary_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM route_analytics_hourly")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(summary_rows, 1);
}

#[tokio::test]
async fn requests_in_different_hours_roll_up_separately() {
    let pool = test_pool().await;
    let buffer = Arc::new(EventBuffer::new());
    let capture = RouteAnalyticsCapture::new(buffer.clone(), NAMESPACE);

    let hour = Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 0).unwrap();
    capture.record(&request_at(hour.timestamp() as f64, 100));
    capture.record(&request_at((hour.timestamp() + 3_700) as f64, 200));

    transfer_route_analytics(&pool, &buffer, NAMESPACE).await;

    // Only the first hour's row is produced by a rollup referenced at H+1.
    let rollup =
        aggregate_route_analytics_hourly(&pool, Some(hour + chrono::Duration::hours(1))).await;
    assert_eq!(rollup.rows_aggregated, 1);
    let total: i64 = sqlx::query_scalar("SELECT total_requests FROM route_analytics_hourly")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(total, 1);

    // The next hour's rollup picks up the second request.
    let rollup =
        aggregate_route_analytics_hourly(&pool, Some(hour + chrono::Duration::hours(2))).await;
    assert_eq!(rollup.rows_aggregated, 1);
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM route_analytics_hourly")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 2);
}
