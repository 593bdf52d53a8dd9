use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use super::pipeline_error;
use crate::models::{SearchRequest, SearchResponse};
use crate::state::AppState;

const MAX_SEARCH_LIMIT: usize = 50;

/// POST /api/search - Hybrid retrieval without generation:
///   1. Semantic and keyword search, concurrently
///   2. Min-max normalized weighted merge
///   3. Cross-encoder rerank when a sidecar is configured
///   4. Hydration from the chunk catalog
pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, (StatusCode, String)> {
    let query = req.query.trim().to_string();
    if query.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Query is required".to_string()));
    }
    let limit = req.limit.clamp(1, MAX_SEARCH_LIMIT);

    let retrieval = state
        .pipeline
        .search(&query, limit)
        .await
        .map_err(pipeline_error)?;

    if let Some(degraded) = &retrieval.degraded {
        tracing::info!("Search for '{query}' degraded: {degraded:?}");
    }

    Ok(Json(SearchResponse {
        query,
        results: retrieval.chunks,
        degraded: retrieval.degraded,
    }))
}
