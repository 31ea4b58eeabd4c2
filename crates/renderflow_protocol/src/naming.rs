//! Topic and channel naming shared by the bus, buffer and relay.

use crate::types::JobId;

/// Progress Bus topic for a job, e.g. `renderflow_dev:job:123`.
pub fn job_channel(namespace: &str, job_id: JobId) -> String {
    format!("{namespace}:job:{job_id}")
}

/// Event Buffer topic for route analytics events.
pub fn route_analytics_stream(namespace: &str) -> String {
    format!("{namespace}:route_analytics:stream")
}

/// Event Buffer topic for generation telemetry events.
pub fn generation_events_stream(namespace: &str) -> String {
    format!("{namespace}:generation_events:stream")
}
