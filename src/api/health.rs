use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub chunks: usize,
    pub vectors: usize,
    pub cache_backend: &'static str,
}

/// GET /api/health - Index sizes and the active cache backend
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        chunks: state.catalog.len(),
        vectors: state.vectors.entry_count(),
        cache_backend: state.pipeline.cache_backend(),
    })
}
