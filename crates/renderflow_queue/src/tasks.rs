//! Canonical task names and queue routing.

/// Executes one generation job end-to-end.
pub const RUN_GENERATION_JOB: &str = "run_generation_job";
/// Drains route-analytics events from the buffer into the raw table.
pub const TRANSFER_ROUTE_ANALYTICS: &str = "transfer_route_analytics";
/// Drains generation events from the buffer into the raw table.
pub const TRANSFER_GENERATION_EVENTS: &str = "transfer_generation_events";
/// Rolls raw route analytics into hourly summaries.
pub const AGGREGATE_ROUTE_ANALYTICS_HOURLY: &str = "aggregate_route_analytics_hourly";
/// Rolls raw generation events into hourly summaries.
pub const AGGREGATE_GENERATION_METRICS_HOURLY: &str = "aggregate_generation_metrics_hourly";
/// Daily tag-cardinality refresh (co-resident; handled outside the core).
pub const REFRESH_TAG_CARDINALITY: &str = "refresh_tag_cardinality_stats";

pub const GENERATION_QUEUE: &str = "generation";
pub const DEFAULT_QUEUE: &str = "default";

/// Routing policy: generation tasks to the `generation` queue, everything
/// else to `default`.
pub fn queue_for(task_name: &str) -> &'static str {
    if task_name == RUN_GENERATION_JOB {
        GENERATION_QUEUE
    } else {
        DEFAULT_QUEUE
    }
}

/// Default retry budget per task. Only generation jobs are retried; the
/// scheduled tasks run to completion or error and recur on their own.
pub fn max_retries_for(task_name: &str) -> i64 {
    if task_name == RUN_GENERATION_JOB {
        3
    } else {
        0
    }
}

/// (soft, hard) execution limits in seconds.
pub fn time_limits_for(task_name: &str) -> (Option<i64>, Option<i64>) {
    if task_name == RUN_GENERATION_JOB {
        (Some(25 * 60), Some(30 * 60))
    } else {
        // Long-running aggregation tasks are not time limited.
        (None, None)
    }
}
