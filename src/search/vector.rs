use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::SemanticIndex;
use crate::models::SearchCandidate;

/// A stored vector entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VectorEntry {
    chunk_id: String,
    document_id: String,
    embedding: Vec<f32>,
}

/// In-memory vector store with disk persistence and cosine similarity search.
pub struct VectorStore {
    entries: RwLock<Vec<VectorEntry>>,
    persist_path: std::path::PathBuf,
    /// 0 = unlimited
    max_entries: usize,
}

impl VectorStore {
    pub fn open_or_create(vector_dir: &Path) -> Result<Self> {
        Self::open_or_create_with_limit(vector_dir, 0)
    }

    pub fn open_or_create_with_limit(vector_dir: &Path, max_entries: usize) -> Result<Self> {
        std::fs::create_dir_all(vector_dir)?;
        let persist_path = vector_dir.join("vectors.json");

        let entries = if persist_path.exists() {
            let data =
                std::fs::read_to_string(&persist_path).context("Failed to read vector store")?;
            serde_json::from_str(&data).with_context(|| {
                format!("Corrupt vector store at {}", persist_path.display())
            })?
        } else {
            Vec::new()
        };

        Ok(Self {
            entries: RwLock::new(entries),
            persist_path,
            max_entries,
        })
    }

    /// Add or replace vectors for chunks. `embeddings` must be parallel with `chunks`.
    pub fn upsert(&self, chunks: &[(String, String)], embeddings: Vec<Vec<f32>>) -> Result<()> {
        anyhow::ensure!(
            chunks.len() == embeddings.len(),
            "Got {} embeddings for {} chunks",
            embeddings.len(),
            chunks.len()
        );

        let replaces = |e: &VectorEntry| chunks.iter().any(|(id, _)| id == &e.chunk_id);
        let mut entries = self.entries.write();

        // Count only entries that survive the replace; nothing is removed on rejection
        let kept = entries.iter().filter(|e| !replaces(*e)).count();
        if self.max_entries > 0 && kept + chunks.len() > self.max_entries {
            anyhow::bail!(
                "Vector store limit reached ({} entries, limit {})",
                entries.len(),
                self.max_entries
            );
        }

        entries.retain(|e| !replaces(e));

        for ((chunk_id, document_id), embedding) in chunks.iter().zip(embeddings) {
            entries.push(VectorEntry {
                chunk_id: chunk_id.clone(),
                document_id: document_id.clone(),
                embedding,
            });
        }

        self.persist(&entries)
    }

    /// Delete all vectors for a document.
    pub fn delete_document(&self, document_id: &str) -> Result<()> {
        let mut entries = self.entries.write();
        entries.retain(|e| e.document_id != document_id);
        self.persist(&entries)
    }

    /// Search by cosine similarity against a query embedding.
    pub fn search_sync(&self, query_embedding: &[f32], limit: usize) -> Vec<SearchCandidate> {
        let entries = self.entries.read();

        let mut scored: Vec<(f32, &VectorEntry)> = entries
            .iter()
            .map(|e| (cosine_similarity(query_embedding, &e.embedding), e))
            .collect();

        // Sort descending by score
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        scored
            .into_iter()
            .map(|(score, e)| SearchCandidate::semantic(e.chunk_id.clone(), score))
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    fn persist(&self, entries: &[VectorEntry]) -> Result<()> {
        let data = serde_json::to_string(entries)?;
        std::fs::write(&self.persist_path, data)?;
        Ok(())
    }
}

#[async_trait]
impl SemanticIndex for VectorStore {
    async fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<SearchCandidate>> {
        Ok(self.search_sync(embedding, top_k))
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}
