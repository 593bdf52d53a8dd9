use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::inflight::InflightRegistry;
use crate::cache::memory::MemoryCache;
use crate::cache::redis::RedisCache;
use crate::cache::sessions::SessionSources;
use crate::cache::ResponseCache;
use crate::config::{CacheBackend, CacheConfig, Config, LlmConfig};
use crate::llm::chat_stream::HttpChatProvider;
use crate::llm::embeddings::{Embedder, HttpEmbedder};
use crate::llm::rerank::CrossEncoderReranker;
use crate::metrics::ShadowRunner;
use crate::pipeline::{ChatPipeline, PipelineSettings};
use crate::search::catalog::ChunkCatalog;
use crate::search::hybrid::{HybridSearcher, HybridWeights};
use crate::search::keyword::Bm25Index;
use crate::search::vector::VectorStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub catalog: Arc<ChunkCatalog>,
    pub keyword: Bm25Index,
    pub vectors: Arc<VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub pipeline: ChatPipeline,
    pub http_client: reqwest::Client,
    pub llm_config: Arc<RwLock<LlmConfig>>,
    pub chat_semaphore: Arc<tokio::sync::Semaphore>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        // Ensure data directories exist
        std::fs::create_dir_all(config.index_dir())?;
        std::fs::create_dir_all(config.vector_dir())?;

        let catalog = Arc::new(ChunkCatalog::open_or_create(&config.catalog_path())?);
        let keyword = Bm25Index::open_or_create(&config.index_dir())?;
        let vectors = Arc::new(VectorStore::open_or_create_with_limit(
            &config.vector_dir(),
            config.max_vector_entries,
        )?);
        tracing::info!(
            "Loaded {} chunks, {} vectors",
            catalog.len(),
            vectors.entry_count()
        );

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        let llm_config = Arc::new(RwLock::new(config.llm.clone()));

        let embedder: Arc<dyn Embedder> =
            Arc::new(HttpEmbedder::new(http_client.clone(), llm_config.clone()));
        let weights = HybridWeights::new(
            config.retrieval.semantic_weight,
            config.retrieval.keyword_weight,
        )?;
        let searcher = HybridSearcher::new(
            embedder.clone(),
            vectors.clone(),
            Arc::new(keyword.clone()),
            weights,
        )
        .with_fetch_multiplier(config.retrieval.fetch_multiplier);

        let cache = open_cache(&config.cache).await;
        let settings = PipelineSettings {
            top_k: config.retrieval.top_k,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            inflight_wait: Duration::from_secs(config.cache.inflight_wait_secs),
        };

        let mut pipeline = ChatPipeline::new(
            searcher,
            catalog.clone(),
            Arc::new(HttpChatProvider::new(http_client.clone(), llm_config.clone())),
            cache,
            settings,
        )
        .with_sessions(Arc::new(SessionSources::new(config.cache.max_sessions)));

        if let Some(reranker) = CrossEncoderReranker::from_config(http_client.clone(), &config.reranker)
        {
            tracing::info!("Cross-encoder rerank enabled");
            pipeline = pipeline.with_reranker(Arc::new(reranker));
        }
        if config.cache.dedupe_inflight {
            pipeline = pipeline.with_inflight(InflightRegistry::new());
        }
        if config.shadow.sample_rate > 0.0 {
            pipeline = pipeline.with_shadow(ShadowRunner::from_config(&config.shadow)?);
        }

        let max_chats = config.max_concurrent_chats;

        Ok(Self {
            config,
            catalog,
            keyword,
            vectors,
            embedder,
            pipeline,
            http_client,
            llm_config,
            chat_semaphore: Arc::new(tokio::sync::Semaphore::new(max_chats)),
        })
    }
}

/// Redis when configured and reachable, otherwise the in-process store.
async fn open_cache(config: &CacheConfig) -> Arc<dyn ResponseCache> {
    let memory = || -> Arc<dyn ResponseCache> {
        Arc::new(MemoryCache::new(
            config.max_entries,
            Duration::from_secs(config.ttl_secs),
        ))
    };

    match config.backend {
        CacheBackend::Memory => memory(),
        CacheBackend::Redis => {
            match RedisCache::connect(&config.redis_url, &config.key_prefix, config.ttl_secs).await
            {
                Ok(cache) => {
                    tracing::info!("Response cache: redis");
                    Arc::new(cache)
                }
                Err(e) => {
                    tracing::warn!("Redis unavailable, falling back to in-memory cache: {e:#}");
                    memory()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_opens_empty_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let state = AppState::new(config).await.unwrap();
        assert!(state.catalog.is_empty());
        assert_eq!(state.vectors.entry_count(), 0);
        assert_eq!(state.pipeline.cache_backend(), "memory");
    }

    #[tokio::test]
    async fn test_unreachable_redis_falls_back_to_memory() {
        let config = CacheConfig {
            backend: CacheBackend::Redis,
            redis_url: "not a redis url".into(),
            ..CacheConfig::default()
        };
        assert_eq!(open_cache(&config).await.backend_name(), "memory");
    }
}
