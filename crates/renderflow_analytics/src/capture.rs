//! Request-path analytics capture.
//!
//! One event per API request goes into the route-analytics stream as a flat
//! string map. The HTTP layer owns timing and header extraction; everything
//! here is pure so it can be tested without a server.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use renderflow_events::EventBuffer;
use renderflow_protocol::naming::route_analytics_stream;
use renderflow_protocol::ErrorCategory;

/// Pagination keys that vary within one semantic query shape.
const VARIABLE_PARAMS: [&str; 4] = ["page", "offset", "limit", "cursor"];

/// Parse a raw query string into a map, unwrapping single values and keeping
/// repeated keys as arrays.
pub fn parse_query_params(query_string: &str) -> Map<String, Value> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in form_urlencoded_pairs(query_string) {
        grouped.entry(key).or_default().push(value);
    }

    let mut params = Map::new();
    for (key, mut values) in grouped {
        let value = if values.len() == 1 {
            Value::String(values.remove(0))
        } else {
            Value::Array(values.into_iter().map(Value::String).collect())
        };
        params.insert(key, value);
    }
    params
}

/// Normalized query params: pagination keys removed, everything else kept
/// with single-value unwrapping. Groups requests that share a semantic shape.
pub fn normalize_query_params(query_string: &str) -> Map<String, Value> {
    let mut params = parse_query_params(query_string);
    for key in VARIABLE_PARAMS {
        params.remove(key);
    }
    params
}

fn form_urlencoded_pairs(query_string: &str) -> Vec<(String, String)> {
    query_string
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                out.push(b' ');
                index += 1;
            }
            b'%' if index + 2 < bytes.len() => {
                match u8::from_str_radix(&raw[index + 1..index + 3], 16) {
                    Ok(byte) => {
                        out.push(byte);
                        index += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        index += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                index += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// One observed API request, as the HTTP layer hands it over.
#[derive(Debug, Clone)]
pub struct RouteRequestRecord {
    pub route: String,
    pub method: String,
    pub query_string: String,
    pub user_id: Option<String>,
    pub status_code: u16,
    pub duration_ms: i64,
    pub request_size_bytes: i64,
    pub response_size_bytes: i64,
    /// Epoch seconds at request start.
    pub timestamp: f64,
}

/// Capture sink writing route events into the Event Buffer.
///
/// `enabled` is decided once at startup; a process without a buffer handle
/// never pays any capture cost.
pub struct RouteAnalyticsCapture {
    buffer: Option<Arc<EventBuffer>>,
    topic: String,
}

impl RouteAnalyticsCapture {
    pub fn new(buffer: Arc<EventBuffer>, namespace: &str) -> Self {
        Self {
            buffer: Some(buffer),
            topic: route_analytics_stream(namespace),
        }
    }

    /// Capture disabled for the process lifetime (buffer unreachable).
    pub fn disabled(namespace: &str) -> Self {
        Self {
            buffer: None,
            topic: route_analytics_stream(namespace),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Record one request. Never fails; errors are not possible past the
    /// startup probe, and a disabled sink is a no-op.
    pub fn record(&self, record: &RouteRequestRecord) {
        let Some(buffer) = &self.buffer else {
            return;
        };

        let query_params = parse_query_params(&record.query_string);
        let query_params_normalized = normalize_query_params(&record.query_string);
        let error_type = ErrorCategory::from_status(record.status_code)
            .map(|c| c.as_str())
            .unwrap_or("");

        let mut fields = BTreeMap::new();
        fields.insert("route".to_string(), record.route.clone());
        fields.insert("method".to_string(), record.method.clone());
        fields.insert(
            "user_id".to_string(),
            record.user_id.clone().unwrap_or_default(),
        );
        fields.insert("timestamp".to_string(), record.timestamp.to_string());
        fields.insert("duration_ms".to_string(), record.duration_ms.to_string());
        fields.insert("status_code".to_string(), record.status_code.to_string());
        fields.insert(
            "query_params".to_string(),
            Value::Object(query_params).to_string(),
        );
        fields.insert(
            "query_params_normalized".to_string(),
            Value::Object(query_params_normalized).to_string(),
        );
        fields.insert(
            "request_size_bytes".to_string(),
            record.request_size_bytes.to_string(),
        );
        fields.insert(
            "response_size_bytes".to_string(),
            record.response_size_bytes.to_string(),
        );
        fields.insert("error_type".to_string(), error_type.to_string());
        fields.insert("cache_status".to_string(), String::new());

        let entry_id = buffer.append(&self.topic, fields);
        debug!(
            "Route analytics captured: {} {} ({}ms) -> entry {}",
            record.method, record.route, record.duration_ms, entry_id
        );
    }
}
