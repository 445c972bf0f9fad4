//! Management router construction

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::ApiState;

/// Build the management app served on hostnames without a registered
/// subdomain.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/api/status", get(handlers::status))
        .route("/{id}", get(handlers::named))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
