//! HTTP router construction.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::api;
use crate::doc::ApiDoc;
use crate::state::AppState;

/// Build the complete application router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ingest", post(api::ingest_one))
        .route("/ingest/batch", post(api::ingest_batch))
        .route("/emails", get(api::list_emails))
        .route("/emails/{id}", get(api::get_email))
        .route("/emails/{id}/reprocess", post(api::reprocess_email))
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics))
        .route("/stats", get(api::stats))
        .route("/queue/status", get(api::queue_status))
        .route("/queue/dls/requeue", post(api::dls_requeue))
        .route("/queue/{stream}/pause", post(api::pause_stream))
        .route("/queue/{stream}/resume", post(api::resume_stream))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
