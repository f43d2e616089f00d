use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;
use tracing::error;

use crate::middleware::Admission;
use crate::response::HealthResponse;
use crate::store::Store;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub admission: Admission,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, admission: Admission) -> Self {
        Self { store, admission }
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(HealthResponse::healthy(true))),
        Err(err) => {
            error!(error = %err, "Store health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse::unhealthy(false)),
            )
        }
    }
}

/// Protected route behind the rate limit middleware
pub async fn index() -> &'static str {
    "Hello, World!"
}
