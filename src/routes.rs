//! HTTP router assembly.

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{handlers, middleware, services::rotation_service::SharedRotationService};

/// Build the application router around a shared, initialized service.
pub fn build_router(service: SharedRotationService) -> Router {
    // Owner-scoped key management routes
    let owner_routes = Router::new()
        .route("/apikey/buat", post(handlers::api_keys::issue_key))
        .route("/apikey/saya", get(handlers::api_keys::list_keys))
        .route(
            "/apikey/{key_id}/update",
            put(handlers::api_keys::rotate_key),
        )
        .route(
            "/apikey/{key_id}/jadwal",
            put(handlers::api_keys::reschedule_key),
        )
        .route(
            "/apikey/{key_id}/nonaktif",
            put(handlers::api_keys::deactivate_key),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            service.clone(),
            middleware::auth::auth_middleware,
        ));

    Router::new()
        // Public routes
        .route("/health", get(handlers::health::health_check))
        .route("/apikey/verifikasi", post(handlers::api_keys::verify_key))
        .merge(owner_routes)
        .layer(TraceLayer::new_for_http())
        // The frontend is served from a different origin
        .layer(CorsLayer::permissive())
        .with_state(service)
}
