//! HTTP route handlers and router configuration

pub mod admin;
pub mod find;
pub mod ingest;

use crate::state::AppState;
use axum::routing::{delete, get, post, put};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the find (query) router.
pub fn build_find_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/multihash/:multihash", get(find::get_multihash))
        .route("/multihash", post(find::post_multihash_batch))
        .route("/providers", get(find::list_providers))
        .route("/providers/:peer_id", get(find::get_provider))
        .route("/health", get(admin::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Build the ingest router.
pub fn build_ingest_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ingest/announce", put(ingest::announce))
        .route("/stats", get(ingest::stats))
        .route("/health", get(admin::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Build the admin router.
pub fn build_admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/admin/allow", post(admin::allow))
        .route("/admin/block", post(admin::block))
        .route("/admin/list-allowed", get(admin::list_allowed))
        .route("/admin/reload", post(admin::reload))
        .route("/admin/freeze", post(admin::freeze))
        .route("/admin/sync/:peer_id", post(admin::sync))
        .route("/admin/providers/:peer_id", delete(admin::remove_provider))
        .route("/admin/import/cidlist/:provider", post(admin::import_cidlist))
        .route(
            "/admin/import/manifest/:provider",
            post(admin::import_manifest),
        )
        .route("/health", get(admin::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
