pub mod scans;
pub mod status;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::middleware::require_api_key;
use crate::state::AppState;

/// Builds the HTTP surface. Every route sits behind the api-key check.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route(
            "/scans",
            post(scans::create_scan)
                .layer(DefaultBodyLimit::disable())
                .get(scans::list_scans),
        )
        .route("/scans/{id}", get(scans::show_scan))
        .route("/status", get(status::service_status))
        .route_layer(from_fn_with_state(state.clone(), require_api_key))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
