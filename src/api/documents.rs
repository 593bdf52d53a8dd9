use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::models::{Chunk, IndexChunksRequest, IndexChunksResponse};
use crate::state::AppState;

const MAX_CHUNKS_PER_REQUEST: usize = 2_000;

/// POST /api/chunks - Index pre-chunked records from the ingestion pipeline.
///
/// The catalog and keyword index are always written. Vectors are best
/// effort: if the embedding provider is down the chunks stay keyword-only
/// until they are submitted again.
pub async fn index_chunks(
    State(state): State<AppState>,
    Json(req): Json<IndexChunksRequest>,
) -> Result<Json<IndexChunksResponse>, (StatusCode, String)> {
    validate_chunks(&req.chunks).map_err(|msg| (StatusCode::BAD_REQUEST, msg))?;

    let response = ingest(&state, req.chunks).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Indexing failed: {e:#}"),
        )
    })?;
    Ok(Json(response))
}

/// DELETE /api/documents/:id - Remove every chunk of a document
pub async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let removed = state.catalog.delete_document(&document_id).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to update chunk catalog: {e:#}"),
        )
    })?;

    if removed.is_empty() {
        return Err((StatusCode::NOT_FOUND, "Document not found".to_string()));
    }

    // Remove from keyword index
    let keyword = state.keyword.clone();
    let doc = document_id.clone();
    match tokio::task::spawn_blocking(move || keyword.delete_document(&doc)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Failed to delete keyword data for {document_id}: {e}"),
        Err(e) => tracing::warn!("Keyword delete task failed for {document_id}: {e}"),
    }

    // Remove from vector store
    if let Err(e) = state.vectors.delete_document(&document_id) {
        tracing::warn!("Failed to delete vector data for {document_id}: {e}");
    }

    tracing::info!("Deleted {} chunks of document {document_id}", removed.len());
    Ok(StatusCode::NO_CONTENT)
}

fn validate_chunks(chunks: &[Chunk]) -> Result<(), String> {
    if chunks.is_empty() {
        return Err("At least one chunk is required".to_string());
    }
    if chunks.len() > MAX_CHUNKS_PER_REQUEST {
        return Err(format!(
            "Too many chunks ({}, limit {MAX_CHUNKS_PER_REQUEST})",
            chunks.len()
        ));
    }
    for chunk in chunks {
        if chunk.id.trim().is_empty() || chunk.document_id.trim().is_empty() {
            return Err("Chunk id and document_id are required".to_string());
        }
        if chunk.content.trim().is_empty() {
            return Err(format!("Chunk {} has no content", chunk.id));
        }
    }
    Ok(())
}

/// Write chunks to the catalog, keyword index and vector store.
pub async fn ingest(state: &AppState, chunks: Vec<Chunk>) -> anyhow::Result<IndexChunksResponse> {
    state.catalog.upsert(&chunks)?;

    let keyword = state.keyword.clone();
    let for_keyword = chunks.clone();
    tokio::task::spawn_blocking(move || keyword.index_chunks(&for_keyword)).await??;

    let texts: Vec<String> = chunks
        .iter()
        .map(|c| format!("{}\n{}", c.document_title, c.content))
        .collect();
    let ids: Vec<(String, String)> = chunks
        .iter()
        .map(|c| (c.id.clone(), c.document_id.clone()))
        .collect();

    let embedded = match state.embedder.embed_batch(&texts).await {
        Ok(embeddings) => {
            state.vectors.upsert(&ids, embeddings)?;
            ids.len()
        }
        Err(e) => {
            tracing::warn!(
                "Vector embedding failed for {} chunks (LLM may not be running): {e:#}",
                ids.len()
            );
            0
        }
    };

    tracing::info!("Indexed {} chunks ({embedded} with vectors)", chunks.len());
    Ok(IndexChunksResponse {
        indexed: chunks.len(),
        embedded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkSource;

    fn chunk(id: &str, doc: &str, content: &str) -> Chunk {
        Chunk {
            id: id.into(),
            document_id: doc.into(),
            document_title: "Bulletin".into(),
            content: content.into(),
            source: ChunkSource::Upload {
                filename: None,
                mime_type: None,
            },
        }
    }

    #[test]
    fn test_validate_rejects_empty_request() {
        assert!(validate_chunks(&[]).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_ids_and_content() {
        assert!(validate_chunks(&[chunk("", "d1", "text")]).is_err());
        assert!(validate_chunks(&[chunk("c1", " ", "text")]).is_err());
        assert!(validate_chunks(&[chunk("c1", "d1", "   ")]).is_err());
    }

    #[test]
    fn test_validate_accepts_well_formed_chunks() {
        assert!(validate_chunks(&[chunk("c1", "d1", "Sunday service at 10")]).is_ok());
    }
}
