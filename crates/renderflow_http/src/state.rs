//! Shared handler state.

use std::sync::Arc;

use renderflow_analytics::RouteAnalyticsCapture;
use renderflow_db::DbPool;
use renderflow_events::{EventBuffer, ProgressBus};
use renderflow_protocol::Settings;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub bus: Arc<ProgressBus>,
    pub capture: Arc<RouteAnalyticsCapture>,
    pub settings: Settings,
}

impl AppState {
    /// Standard wiring: capture enabled against the process buffer.
    pub fn new(pool: DbPool, bus: Arc<ProgressBus>, buffer: Arc<EventBuffer>, settings: Settings) -> Self {
        Self {
            pool,
            bus,
            capture: Arc::new(RouteAnalyticsCapture::new(buffer, &settings.namespace)),
            settings,
        }
    }

    /// Wiring for processes without a reachable Event Buffer: capture is
    /// disabled for the process lifetime.
    pub fn without_capture(pool: DbPool, bus: Arc<ProgressBus>, settings: Settings) -> Self {
        Self {
            pool,
            bus,
            capture: Arc::new(RouteAnalyticsCapture::disabled(&settings.namespace)),
            settings,
        }
    }
}
