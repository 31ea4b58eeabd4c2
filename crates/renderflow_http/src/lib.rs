//! HTTP surface: the WebSocket progress relay, the analytics capture layer
//! and the analytics REST endpoints.
//!
//! The submission REST handlers live with the thin API surface; this crate
//! carries only the long-lived streaming endpoint and the read-side
//! analytics contract.

pub mod middleware;
pub mod relay;
pub mod routes;
pub mod state;

use axum::Router;

pub use state::AppState;

/// Full router: relay endpoints + analytics surfaces, with the capture layer
/// installed across the `/api/` tree.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(relay::router())
        .merge(routes::router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::capture_route_analytics,
        ))
        .with_state(state)
}
