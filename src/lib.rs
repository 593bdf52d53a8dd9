//! # patmos-retrieval
//!
//! Hybrid retrieval and response caching for a document chat service.
//! Questions are answered from an organization's uploaded documents and
//! externally synced records, with a semantic + keyword search in front of
//! a streaming LLM and a cache in front of both.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌──────────────┐
//!                       │   Question   │
//!                       └──────┬───────┘
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │  Normalize + cache    │──hit──► cached answer
//!                  │  key (requester,      │
//!                  │  question, sources)   │
//!                  └───────────┬───────────┘
//!                              │ miss
//!                 ┌────────────┴────────────┐
//!                 ▼                         ▼
//!        ┌────────────────┐       ┌──────────────────┐
//!        │ Semantic search│       │  Keyword (BM25)  │
//!        │ (embed+cosine) │       │  search          │
//!        └───────┬────────┘       └────────┬─────────┘
//!                └────────────┬────────────┘
//!                             ▼
//!                 ┌───────────────────────┐
//!                 │ Min-max normalize     │
//!                 │ Weighted merge 70/30  │
//!                 │ Dedupe, top K         │
//!                 └───────────┬───────────┘
//!                             ▼
//!                 ┌───────────────────────┐
//!                 │ Cross-encoder rerank  │  (optional)
//!                 └───────────┬───────────┘
//!                             ▼
//!                 ┌───────────────────────┐
//!                 │ Hydrate, prompt,      │
//!                 │ stream, cache write   │
//!                 └───────────────────────┘
//! ```
//!
//! Every request carries a timing record that is emitted on completion,
//! and a small sample also runs an alternate retrieval configuration in
//! the background to measure result overlap.
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration
//! - [`error`] - Typed errors for search, cache, normalization and generation
//! - [`models`] - Chunks, source metadata, search candidates, cache entries, request/response types
//! - [`cache`] - Cache keys, memory and Redis stores, in-flight markers, per-requester source state
//! - [`search::catalog`] - Chunk records used for metadata hydration
//! - [`search::keyword`] - BM25 full-text index powered by tantivy
//! - [`search::vector`] - In-memory vector store with cosine similarity and disk persistence
//! - [`search::hybrid`] - Normalized weighted merge of semantic and keyword results
//! - [`llm`] - Embeddings, streaming chat, cross-encoder rerank and prompt assembly
//! - [`metrics`] - Per-request timing records and shadow retrieval runs
//! - [`pipeline`] - Chat orchestration from question to cached answer
//! - [`api`] - Axum HTTP handlers for search, chat, indexing and health
//! - [`state`] - Shared application state

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod search;
pub mod state;
