//! API route definitions

use super::handlers::{self, FeatherState};
use super::ws_handlers;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the API router
pub fn create_router(state: FeatherState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handlers::health))
        // ====================================================================
        // Records
        // ====================================================================
        .route("/data/{name}", post(handlers::create_record))
        .route("/data/{name}/query", post(handlers::query_records))
        .route(
            "/data/{name}/{id}",
            get(handlers::get_record)
                .patch(handlers::patch_record)
                .delete(handlers::delete_record),
        )
        // ====================================================================
        // Functions
        // ====================================================================
        .route("/do/{function}", post(handlers::call_function))
        // ====================================================================
        // Feathers
        // ====================================================================
        .route(
            "/feather/{name}",
            get(handlers::get_feather)
                .put(handlers::save_feather)
                .delete(handlers::delete_feather),
        )
        // ====================================================================
        // Change notifications
        // ====================================================================
        .route("/ws/events", get(ws_handlers::ws_events))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
