//! API route definitions

use crate::models::{ModelLoader, ModelRegistry};
use crate::registry::Registry;
use crate::state::StateManager;
use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub model_registry: Arc<ModelRegistry>,
    pub state_manager: Arc<StateManager>,
    pub loader: Arc<ModelLoader>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
///
/// Model ids contain slashes, so lookups on a single model use a wildcard
/// segment while the download and verify actions take the id in the body.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Runtime management (no PATCH - delete and recreate instead)
        .route("/runtimes", get(handlers::list_runtimes))
        .route("/runtimes", post(handlers::create_runtime))
        .route("/runtimes/{name}", get(handlers::get_runtime))
        .route("/runtimes/{name}", delete(handlers::delete_runtime))
        // Runtime lifecycle
        .route("/runtimes/{name}/start", post(handlers::start_runtime))
        .route("/runtimes/{name}/stop", post(handlers::stop_runtime))
        .route("/runtimes/{name}/restart", post(handlers::restart_runtime))
        .route("/runtimes/{name}/logs", get(handlers::get_logs))
        // Model registry
        .route("/models", get(handlers::list_models))
        .route("/models", post(handlers::add_model))
        .route("/models/download", post(handlers::download_model))
        .route("/models/verify", post(handlers::verify_model))
        .route("/models/{*model_id}", get(handlers::get_model))
        .route("/models/{*model_id}", delete(handlers::remove_model))
        // Inference
        .route("/generate", post(handlers::generate))
        .route("/chat", post(handlers::chat))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
