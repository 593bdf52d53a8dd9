use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A unit of retrievable text produced by the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    #[serde(default)]
    pub document_title: String,
    pub content: String,
    pub source: ChunkSource,
}

/// Where a chunk came from, with the facts each kind of source carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkSource {
    /// A document uploaded by a user.
    Upload {
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
    },
    /// A record synced from an external API on a schedule.
    External {
        provider: String,
        #[serde(default)]
        dataset: Option<String>,
        #[serde(default)]
        synced_at: Option<DateTime<Utc>>,
        #[serde(default)]
        facts: BTreeMap<String, String>,
    },
}

impl ChunkSource {
    /// Canonical tag used in cache keys and citations.
    pub fn source_tag(&self) -> String {
        match self {
            ChunkSource::Upload { .. } => "upload".to_string(),
            ChunkSource::External { provider, .. } => format!("external:{provider}"),
        }
    }

    /// Last sync time of externally sourced data, if any.
    pub fn freshness(&self) -> Option<DateTime<Utc>> {
        match self {
            ChunkSource::Upload { .. } => None,
            ChunkSource::External { synced_at, .. } => *synced_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Semantic,
    Keyword,
}

/// A raw hit from one search backend. Lives only for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCandidate {
    pub chunk_id: String,
    pub score: f32,
    pub origin: Origin,
}

impl SearchCandidate {
    pub fn semantic(chunk_id: impl Into<String>, score: f32) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            score,
            origin: Origin::Semantic,
        }
    }

    pub fn keyword(chunk_id: impl Into<String>, score: f32) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            score,
            origin: Origin::Keyword,
        }
    }
}

/// A deduplicated candidate after weighting. Per-origin scores are the
/// min-max normalized values, 0 when the chunk was absent from that list.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MergedResult {
    pub chunk_id: String,
    pub semantic_score: f32,
    pub keyword_score: f32,
    pub combined_score: f32,
    pub rerank_score: Option<f32>,
}

/// A merged result joined with its chunk record.
#[derive(Debug, Clone, Serialize)]
pub struct RankedChunk {
    pub chunk: Chunk,
    pub semantic_score: f32,
    pub keyword_score: f32,
    pub combined_score: f32,
    pub rerank_score: Option<f32>,
}

/// Source attribution returned alongside an answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub document_title: String,
    pub source_tag: String,
    pub score: f32,
}

impl From<&RankedChunk> for Citation {
    fn from(r: &RankedChunk) -> Self {
        Self {
            chunk_id: r.chunk.id.clone(),
            document_id: r.chunk.document_id.clone(),
            document_title: r.chunk.document_title.clone(),
            source_tag: r.chunk.source.source_tag(),
            score: r.rerank_score.unwrap_or(r.combined_score),
        }
    }
}

/// A previously generated answer stored under a normalized key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub answer: String,
    pub sources: Vec<Citation>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(answer: impl Into<String>, sources: Vec<Citation>) -> Self {
        Self {
            answer: answer.into(),
            sources,
            created_at: Utc::now(),
        }
    }
}

/// Why a search returned results from only one backend.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "unavailable", content = "reason", rename_all = "snake_case")]
pub enum Degradation {
    Semantic(String),
    Keyword(String),
}

/// Search request
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// Search response
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<RankedChunk>,
    pub degraded: Option<Degradation>,
}

/// Chat request
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Authenticated user id, or an anonymous session id.
    pub requester: String,
    pub history: Option<Vec<ChatMessage>>,
}

/// A single chat turn (user or assistant)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Pre-chunked records handed over by the ingestion pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexChunksRequest {
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexChunksResponse {
    pub indexed: usize,
    /// Chunks that also got a vector; 0 when the embedding provider was down
    pub embedded: usize,
}
