//! Retrieval backends and the hybrid merger that sits on top of them.
//!
//! The vector store and keyword index are reached through the narrow
//! [`SemanticIndex`] / [`KeywordIndex`] traits so that hosted services can
//! replace the local implementations without touching the merger.

pub mod catalog;
pub mod hybrid;
pub mod keyword;
pub mod vector;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, SearchCandidate};

/// Embedding-similarity search.
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    /// Up to `top_k` candidates, best first.
    async fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<SearchCandidate>>;
}

/// Lexical full-text search.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// Up to `top_k` candidates, best first.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchCandidate>>;
}

/// Resolves chunk ids to full records (metadata hydration).
#[async_trait]
pub trait ChunkLookup: Send + Sync {
    /// Records for the ids that exist, in the order requested.
    async fn fetch(&self, ids: &[String]) -> Result<Vec<Chunk>>;
}
