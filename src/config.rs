use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the keyword index, vectors and chunk catalog are stored
    pub data_dir: PathBuf,
    /// Server bind address
    pub bind_addr: String,
    /// LLM provider configuration
    pub llm: LlmConfig,
    /// Cross-encoder reranker configuration
    pub reranker: RerankerConfig,
    pub retrieval: RetrievalConfig,
    pub cache: CacheConfig,
    pub shadow: ShadowConfig,
    /// Maximum total vector entries in memory (0 = unlimited)
    pub max_vector_entries: usize,
    /// Maximum concurrent chat generations
    pub max_concurrent_chats: usize,
    /// Seconds without a token before a generation is abandoned
    pub idle_timeout_secs: u64,
}

/// Configuration for the cross-encoder reranker sidecar (e.g. llama-server with Qwen3-Reranker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    /// Base URL for the reranker API (e.g. "http://127.0.0.1:8082").
    /// If None, the rerank stage is skipped.
    pub base_url: Option<String>,
    /// Model name to send in the rerank request.
    pub model: Option<String>,
    /// Request timeout in seconds (capped at 30).
    pub timeout_secs: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "ollama" or "openai"
    pub provider: String,
    /// Base URL for the LLM API
    pub base_url: String,
    /// Model name for chat generation
    pub chat_model: String,
    /// Model name for embeddings
    pub embedding_model: String,
    /// API key (only needed for cloud providers)
    pub api_key: Option<String>,
    /// Embedding vector dimension
    pub embedding_dim: usize,
}

/// Hybrid search tuning. Weights are rescaled to sum to 1 when the
/// searcher is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    /// Chunks placed in the LLM context
    pub top_k: usize,
    /// Each backend fetches `top_k * fetch_multiplier` candidates
    pub fetch_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_weight: 0.7,
            keyword_weight: 0.3,
            top_k: 8,
            fetch_multiplier: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    /// Only read when `backend` is `Redis`
    pub redis_url: String,
    pub key_prefix: String,
    /// In-process entry bound (memory backend)
    pub max_entries: usize,
    pub ttl_secs: u64,
    /// Make concurrent misses on one key wait for the first generation
    pub dedupe_inflight: bool,
    pub inflight_wait_secs: u64,
    /// Requesters whose last-retrieval source state is remembered
    pub max_sessions: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis_url: "redis://127.0.0.1/".to_string(),
            key_prefix: "patmos:answer:".to_string(),
            max_entries: 1_000,
            ttl_secs: 24 * 60 * 60,
            dedupe_inflight: false,
            inflight_wait_secs: 30,
            max_sessions: 10_000,
        }
    }
}

/// Alternate retrieval configuration exercised on sampled requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    pub sample_rate: f64,
    pub top_k: usize,
    pub semantic_weight: f32,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            sample_rate: 0.02,
            top_k: 12,
            semantic_weight: 0.5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:9000".to_string(),
            llm: LlmConfig::default(),
            reranker: RerankerConfig::default(),
            retrieval: RetrievalConfig::default(),
            cache: CacheConfig::default(),
            shadow: ShadowConfig::default(),
            max_vector_entries: 500_000,
            max_concurrent_chats: 8,
            idle_timeout_secs: 30,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            chat_model: "llama3.2".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            api_key: None,
            embedding_dim: 768,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("PATMOS_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("PATMOS_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_CHAT_MODEL") {
            config.llm.chat_model = model;
        }
        if let Ok(model) = std::env::var("LLM_EMBEDDING_MODEL") {
            config.llm.embedding_model = model;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }
        if let Some(d) = env_parse("LLM_EMBEDDING_DIM") {
            config.llm.embedding_dim = d;
        }

        // Reranker config
        if let Ok(url) = std::env::var("RERANKER_BASE_URL") {
            config.reranker.base_url = Some(url);
        }
        if let Ok(model) = std::env::var("RERANKER_MODEL") {
            config.reranker.model = Some(model);
        }
        if let Some(v) = env_parse::<u64>("RERANKER_TIMEOUT_SECS") {
            config.reranker.timeout_secs = v.min(30); // Cap at 30s
        }

        // Retrieval
        if let Some(v) = env_parse("PATMOS_SEMANTIC_WEIGHT") {
            config.retrieval.semantic_weight = v;
        }
        if let Some(v) = env_parse("PATMOS_KEYWORD_WEIGHT") {
            config.retrieval.keyword_weight = v;
        }
        if let Some(v) = env_parse::<usize>("PATMOS_TOP_K") {
            config.retrieval.top_k = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("PATMOS_FETCH_MULTIPLIER") {
            config.retrieval.fetch_multiplier = v.max(1);
        }

        // Response cache
        if let Ok(backend) = std::env::var("PATMOS_CACHE_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "redis" => config.cache.backend = CacheBackend::Redis,
                "memory" => config.cache.backend = CacheBackend::Memory,
                other => tracing::warn!("Unknown cache backend '{other}', keeping memory"),
            }
        }
        if let Ok(url) = std::env::var("PATMOS_REDIS_URL") {
            config.cache.redis_url = url;
        }
        if let Ok(prefix) = std::env::var("PATMOS_CACHE_PREFIX") {
            config.cache.key_prefix = prefix;
        }
        if let Some(v) = env_parse::<usize>("PATMOS_CACHE_MAX_ENTRIES") {
            config.cache.max_entries = v.max(1);
        }
        if let Some(v) = env_parse("PATMOS_CACHE_TTL_SECS") {
            config.cache.ttl_secs = v;
        }
        if let Some(v) = env_parse("PATMOS_DEDUPE_INFLIGHT") {
            config.cache.dedupe_inflight = v;
        }
        if let Some(v) = env_parse("PATMOS_INFLIGHT_WAIT_SECS") {
            config.cache.inflight_wait_secs = v;
        }
        if let Some(v) = env_parse::<usize>("PATMOS_MAX_SESSIONS") {
            config.cache.max_sessions = v.max(1);
        }

        // Shadow runs
        if let Some(v) = env_parse::<f64>("PATMOS_SHADOW_SAMPLE_RATE") {
            config.shadow.sample_rate = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_parse::<usize>("PATMOS_SHADOW_TOP_K") {
            config.shadow.top_k = v.max(1);
        }
        if let Some(v) = env_parse("PATMOS_SHADOW_SEMANTIC_WEIGHT") {
            config.shadow.semantic_weight = v;
        }

        if let Some(v) = env_parse("PATMOS_MAX_VECTOR_ENTRIES") {
            config.max_vector_entries = v;
        }
        if let Some(v) = env_parse::<usize>("PATMOS_MAX_CONCURRENT_CHATS") {
            config.max_concurrent_chats = v.max(1);
        }
        if let Some(v) = env_parse("PATMOS_IDLE_TIMEOUT_SECS") {
            config.idle_timeout_secs = v;
        }

        config
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("chunks.json")
    }
}
