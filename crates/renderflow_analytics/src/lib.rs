//! Analytics pipeline: request capture, buffer-to-table transfer, hourly
//! rollups and cache-priority scoring.

pub mod cache_priority;
pub mod capture;
pub mod rollup;
pub mod stats;
pub mod transfer;
pub mod trends;

pub use cache_priority::{
    top_routes_absolute, top_routes_relative, AbsoluteParams, RouteCachePriority,
};
pub use capture::{normalize_query_params, parse_query_params, RouteAnalyticsCapture, RouteRequestRecord};
pub use rollup::{
    aggregate_generation_metrics_hourly, aggregate_route_analytics_hourly, RollupReport,
};
pub use transfer::{transfer_generation_events, transfer_route_analytics, TransferReport};
pub use trends::{peak_hours, performance_trends, Granularity, PeakHour, TrendPoint};
