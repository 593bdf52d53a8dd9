use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::*;
use tantivy::{doc, Index, IndexWriter, ReloadPolicy, Term};

use super::KeywordIndex;
use crate::models::{Chunk, SearchCandidate};

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// BM25 keyword index over chunk text, built on tantivy.
///
/// Cheap to clone; searches run on the blocking pool.
#[derive(Clone)]
pub struct Bm25Index {
    inner: Arc<Inner>,
}

struct Inner {
    index: Index,
    f_chunk_id: Field,
    f_document_id: Field,
    f_title: Field,
    f_content: Field,
}

impl Bm25Index {
    /// Create or open a BM25 index at the given directory.
    pub fn open_or_create(index_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(index_dir)?;

        let mut schema_builder = Schema::builder();
        let f_chunk_id = schema_builder.add_text_field("chunk_id", STRING | STORED);
        let f_document_id = schema_builder.add_text_field("document_id", STRING | STORED);
        let f_title = schema_builder.add_text_field("title", TEXT);
        let f_content = schema_builder.add_text_field("content", TEXT);
        let schema = schema_builder.build();

        let index = if index_dir.join("meta.json").exists() {
            Index::open_in_dir(index_dir).context("Failed to open existing tantivy index")?
        } else {
            Index::create_in_dir(index_dir, schema).context("Failed to create tantivy index")?
        };

        Ok(Self {
            inner: Arc::new(Inner {
                index,
                f_chunk_id,
                f_document_id,
                f_title,
                f_content,
            }),
        })
    }

    /// Index chunks, replacing any earlier copy with the same id.
    pub fn index_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let inner = &self.inner;
        let mut writer: IndexWriter = inner
            .index
            .writer(WRITER_HEAP_BYTES)
            .context("Failed to create index writer")?;

        for chunk in chunks {
            writer.delete_term(Term::from_field_text(inner.f_chunk_id, &chunk.id));
            writer.add_document(doc!(
                inner.f_chunk_id => chunk.id.clone(),
                inner.f_document_id => chunk.document_id.clone(),
                inner.f_title => chunk.document_title.clone(),
                inner.f_content => chunk.content.clone(),
            ))?;
        }

        writer.commit().context("Failed to commit index")?;
        Ok(())
    }

    /// Delete all chunks of a document.
    pub fn delete_document(&self, document_id: &str) -> Result<()> {
        let inner = &self.inner;
        let mut writer: IndexWriter = inner
            .index
            .writer(WRITER_HEAP_BYTES)
            .context("Failed to create index writer")?;

        writer.delete_term(Term::from_field_text(inner.f_document_id, document_id));
        writer.commit().context("Failed to commit delete")?;
        Ok(())
    }

    /// Search synchronously. Free-form user text is parsed leniently, so
    /// stray operators or quotes never fail the query.
    pub fn search_blocking(&self, query_str: &str, limit: usize) -> Result<Vec<SearchCandidate>> {
        let inner = &self.inner;
        if limit == 0 || query_str.trim().is_empty() {
            return Ok(Vec::new());
        }

        let reader = inner
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("Failed to create reader")?;
        let searcher = reader.searcher();

        let query_parser = QueryParser::for_index(&inner.index, vec![inner.f_content, inner.f_title]);
        let (query, parse_errors) = query_parser.parse_query_lenient(query_str);
        if !parse_errors.is_empty() {
            tracing::debug!("Keyword query parsed leniently ({} issues)", parse_errors.len());
        }

        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(limit))
            .context("Search failed")?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .context("Failed to retrieve document")?;

            let Some(chunk_id) = doc.get_first(inner.f_chunk_id).and_then(|v| v.as_str()) else {
                continue;
            };
            hits.push(SearchCandidate::keyword(chunk_id, score));
        }

        Ok(hits)
    }
}

#[async_trait]
impl KeywordIndex for Bm25Index {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchCandidate>> {
        let index = self.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || index.search_blocking(&query, top_k))
            .await
            .context("Keyword search task panicked")?
    }
}
