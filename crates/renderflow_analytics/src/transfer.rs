//! Analytics transfer: drain the Event Buffer into the durable raw tables.
//!
//! Each run reads up to 1000 entries from the earliest retained id. Reads
//! deliberately restart at the origin every run; the scheduled trim bounds
//! the re-read window and the rollup upsert collapses the duplicate rows.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{error, info};

use renderflow_db::DbPool;
use renderflow_events::{EventBuffer, EventBufferEntry, StreamId};
use renderflow_protocol::defaults::{EVENT_BUFFER_MAX_LEN, TRANSFER_BATCH_SIZE};
use renderflow_protocol::naming::{generation_events_stream, route_analytics_stream};

/// Outcome of one transfer run, serializable as the task result payload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransferReport {
    pub status: &'static str,
    pub events_transferred: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TransferReport {
    fn success(events_transferred: usize) -> Self {
        Self {
            status: "success",
            events_transferred,
            error: None,
            timestamp: Utc::now(),
        }
    }

    fn failure(error: String) -> Self {
        Self {
            status: "error",
            events_transferred: 0,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }
}

/// Transfer route-analytics events into `route_analytics`.
pub async fn transfer_route_analytics(
    pool: &DbPool,
    buffer: &Arc<EventBuffer>,
    namespace: &str,
) -> TransferReport {
    let topic = route_analytics_stream(namespace);
    info!("Starting route analytics transfer");

    let entries = buffer.range(&topic, StreamId::ZERO, TRANSFER_BATCH_SIZE);
    if entries.is_empty() {
        info!("No route analytics events to transfer");
        return TransferReport::success(0);
    }

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(e) => return TransferReport::failure(e.to_string()),
    };

    let mut inserted = 0usize;
    for entry in &entries {
        match insert_route_event(&mut tx, entry).await {
            Ok(()) => inserted += 1,
            Err(e) => error!("Failed to insert route event {}: {}", entry.id, e),
        }
    }

    if let Err(e) = tx.commit().await {
        error!("Failed to commit route analytics transfer: {e}");
        return TransferReport::failure(e.to_string());
    }

    info!("Transferred {} route analytics events", inserted);
    buffer.trim(&topic, EVENT_BUFFER_MAX_LEN, true);
    TransferReport::success(inserted)
}

async fn insert_route_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &EventBufferEntry,
) -> Result<(), sqlx::Error> {
    let get = |key: &str| entry.fields.get(key).map(String::as_str).unwrap_or("");

    // Event timestamps are epoch seconds; unparseable values fall back to now.
    let timestamp = get("timestamp")
        .parse::<f64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs as i64, ((secs.fract()) * 1e9) as u32).single())
        .unwrap_or_else(Utc::now);

    sqlx::query(
        r#"
        INSERT INTO route_analytics (
            route, method, user_id, timestamp, duration_ms, status_code,
            query_params, query_params_normalized,
            request_size_bytes, response_size_bytes,
            error_type, cache_status, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(get("route"))
    .bind(non_empty_or(get("method"), "GET"))
    .bind(empty_to_none(get("user_id")))
    .bind(timestamp)
    .bind(get("duration_ms").parse::<i64>().unwrap_or(0))
    .bind(get("status_code").parse::<i64>().unwrap_or(500))
    .bind(non_empty_or(get("query_params"), "{}"))
    .bind(non_empty_or(get("query_params_normalized"), "{}"))
    .bind(nonzero_int(get("request_size_bytes")))
    .bind(nonzero_int(get("response_size_bytes")))
    .bind(empty_to_none(get("error_type")))
    .bind(empty_to_none(get("cache_status")))
    .bind(timestamp)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Transfer generation events into `generation_events`.
pub async fn transfer_generation_events(
    pool: &DbPool,
    buffer: &Arc<EventBuffer>,
    namespace: &str,
) -> TransferReport {
    let topic = generation_events_stream(namespace);
    info!("Starting generation events transfer");

    let entries = buffer.range(&topic, StreamId::ZERO, TRANSFER_BATCH_SIZE);
    if entries.is_empty() {
        info!("No generation events to transfer");
        return TransferReport::success(0);
    }

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(e) => return TransferReport::failure(e.to_string()),
    };

    let mut inserted = 0usize;
    for entry in &entries {
        match insert_generation_event(&mut tx, entry).await {
            Ok(()) => inserted += 1,
            Err(e) => error!("Failed to insert generation event {}: {}", entry.id, e),
        }
    }

    if let Err(e) = tx.commit().await {
        error!("Failed to commit generation events transfer: {e}");
        return TransferReport::failure(e.to_string());
    }

    info!("Transferred {} generation events", inserted);
    buffer.trim(&topic, EVENT_BUFFER_MAX_LEN, true);
    TransferReport::success(inserted)
}

async fn insert_generation_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &EventBufferEntry,
) -> Result<(), sqlx::Error> {
    let get = |key: &str| entry.fields.get(key).map(String::as_str).unwrap_or("");

    // Generation events carry RFC 3339 timestamps.
    let timestamp = DateTime::parse_from_rfc3339(get("timestamp"))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let success = match get("success") {
        "" => None,
        raw => Some(raw.eq_ignore_ascii_case("true")),
    };

    sqlx::query(
        r#"
        INSERT INTO generation_events (
            event_type, generation_id, user_id, timestamp,
            generation_type, duration_ms, success, error_type, error_message,
            queue_wait_time_ms, generation_time_ms, model_checkpoint,
            image_dimensions, batch_size, prompt_tokens, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(non_empty_or(get("event_type"), "request"))
    .bind(get("generation_id").parse::<i64>().ok())
    .bind(empty_to_none(get("user_id")))
    .bind(timestamp)
    .bind(empty_to_none(get("generation_type")))
    .bind(get("duration_ms").parse::<i64>().ok())
    .bind(success)
    .bind(empty_to_none(get("error_type")))
    .bind(empty_to_none(get("error_message")))
    .bind(get("queue_wait_time_ms").parse::<i64>().ok())
    .bind(get("generation_time_ms").parse::<i64>().ok())
    .bind(empty_to_none(get("model_checkpoint")))
    .bind(empty_to_none(get("image_dimensions")))
    .bind(get("batch_size").parse::<i64>().ok())
    .bind(get("prompt_tokens").parse::<i64>().ok())
    .bind(timestamp)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn empty_to_none(raw: &str) -> Option<String> {
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

fn non_empty_or(raw: &str, default: &str) -> String {
    if raw.is_empty() {
        default.to_string()
    } else {
        raw.to_string()
    }
}

/// Zero and unparseable byte counts are stored as NULL.
fn nonzero_int(raw: &str) -> Option<i64> {
    raw.parse::<i64>().ok().filter(|v| *v != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderflow_db::{create_pool, ensure_schema, DbConfig};
    use std::collections::BTreeMap;

    fn route_fields(status: &str, duration: &str) -> BTreeMap<String, String> {
        [
            ("route", "/api/v1/content/unified"),
            ("method", "GET"),
            ("user_id", ""),
            ("timestamp", "1760000000.25"),
            ("duration_ms", duration),
            ("status_code", status),
            ("query_params", r#"{"page":"2"}"#),
            ("query_params_normalized", "{}"),
            ("request_size_bytes", "0"),
            ("response_size_bytes", "2048"),
            ("error_type", ""),
            ("cache_status", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[tokio::test]
    async fn empty_buffer_transfers_nothing() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let buffer = Arc::new(EventBuffer::new());

        let report = transfer_route_analytics(&pool, &buffer, "renderflow_test").await;
        assert_eq!(report.status, "success");
        assert_eq!(report.events_transferred, 0);
    }

    #[tokio::test]
    async fn route_events_coerce_fields() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let buffer = Arc::new(EventBuffer::new());
        let topic = route_analytics_stream("renderflow_test");

        buffer.append(&topic, route_fields("200", "120"));
        buffer.append(&topic, route_fields("503", "not-a-number"));

        let report = transfer_route_analytics(&pool, &buffer, "renderflow_test").await;
        assert_eq!(report.status, "success");
        assert_eq!(report.events_transferred, 2);

        let (count, null_request_sizes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(*) FILTER (WHERE request_size_bytes IS NULL) FROM route_analytics",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 2);
        // Zero request sizes land as NULL.
        assert_eq!(null_request_sizes, 2);

        let bad_duration: i64 = sqlx::query_scalar(
            "SELECT duration_ms FROM route_analytics WHERE status_code = 503",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(bad_duration, 0);
    }

    #[tokio::test]
    async fn rerun_duplicates_are_tolerated() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let buffer = Arc::new(EventBuffer::new());
        let topic = route_analytics_stream("renderflow_test");
        buffer.append(&topic, route_fields("200", "100"));

        // Reads restart at the origin each run; the raw table tolerates the
        // duplicates (the rollup upsert collapses them).
        transfer_route_analytics(&pool, &buffer, "renderflow_test").await;
        transfer_route_analytics(&pool, &buffer, "renderflow_test").await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM route_analytics")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn generation_events_parse_optionals() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let buffer = Arc::new(EventBuffer::new());
        let topic = generation_events_stream("renderflow_test");

        let fields: BTreeMap<String, String> = [
            ("event_type", "completion"),
            ("generation_id", "7"),
            ("user_id", "u-1"),
            ("timestamp", "2026-03-01T12:30:00+00:00"),
            ("generation_type", "image"),
            ("duration_ms", "4500"),
            ("success", "true"),
            ("error_type", ""),
            ("error_message", ""),
            ("queue_wait_time_ms", ""),
            ("generation_time_ms", "4380"),
            ("model_checkpoint", "illustriousXL_v01.safetensors"),
            ("image_dimensions", "832x1216"),
            ("batch_size", "2"),
            ("prompt_tokens", "12"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        buffer.append(&topic, fields);

        let report = transfer_generation_events(&pool, &buffer, "renderflow_test").await;
        assert_eq!(report.events_transferred, 1);

        let (success, queue_wait, batch): (bool, Option<i64>, i64) = sqlx::query_as(
            "SELECT success, queue_wait_time_ms, batch_size FROM generation_events",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(success);
        assert_eq!(queue_wait, None);
        assert_eq!(batch, 2);
    }
}
