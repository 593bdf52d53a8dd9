//! Chat orchestration over the retrieval and caching core.
//!
//! ```text
//! normalize ─► cache check ──hit──► replay cached answer
//!                  │ miss
//!                  ▼
//!          hybrid search ─► rerank? ─► hydrate ─► prompt ─► stream ─► cache write
//!                  │
//!                  └─► shadow run (sampled, detached)
//! ```
//!
//! The cache is written only when a generation runs to natural completion.
//! Errors, idle timeouts and dropped streams leave it untouched.

use futures_util::stream::{self, Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::inflight::{Acquired, InflightGuard, InflightRegistry};
use crate::cache::key::{build_cache_key, CacheKeyInput};
use crate::cache::sessions::{SessionSources, SourceState};
use crate::cache::ResponseCache;
use crate::error::{GenerationError, PipelineError};
use crate::llm::chat_stream::{ChatProvider, ChatStream, StreamChunk};
use crate::llm::prompt::{
    build_context_block, build_messages, build_system_prompt, sanitize_for_prompt,
    truncate_to_char_boundary, validate_and_sanitize_history, MAX_CHAT_MESSAGE_LEN,
};
use crate::llm::rerank::{apply_rerank, RerankResult, Reranker};
use crate::metrics::{
    build_metrics, MetricsContext, PerformanceTimings, RequestMetrics, ShadowRunner, Stage,
};
use crate::models::{CacheEntry, ChatMessage, Citation, Degradation, MergedResult, RankedChunk};
use crate::search::hybrid::HybridSearcher;
use crate::search::ChunkLookup;

/// One user question.
#[derive(Debug, Clone)]
pub struct ChatQuery {
    pub question: String,
    pub requester: String,
    pub history: Option<Vec<ChatMessage>>,
}

/// What the renderer receives, in order: one `Context`, any number of
/// `Delta`s, then either `Done` or `Error`.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Context {
        sources: Vec<Citation>,
        cache_hit: bool,
        degraded: Option<Degradation>,
    },
    Delta(String),
    Done(RequestMetrics),
    Error(String),
}

pub type AnswerStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

/// Hydrated results of one retrieval.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub chunks: Vec<RankedChunk>,
    pub degraded: Option<Degradation>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub top_k: usize,
    pub idle_timeout: Duration,
    pub inflight_wait: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            top_k: 8,
            idle_timeout: Duration::from_secs(30),
            inflight_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct ChatPipeline {
    searcher: HybridSearcher,
    chunks: Arc<dyn ChunkLookup>,
    llm: Arc<dyn ChatProvider>,
    cache: Arc<dyn ResponseCache>,
    sessions: Arc<SessionSources>,
    reranker: Option<Arc<dyn Reranker>>,
    inflight: Option<Arc<InflightRegistry>>,
    shadow: Option<ShadowRunner>,
    settings: PipelineSettings,
}

impl ChatPipeline {
    pub fn new(
        searcher: HybridSearcher,
        chunks: Arc<dyn ChunkLookup>,
        llm: Arc<dyn ChatProvider>,
        cache: Arc<dyn ResponseCache>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            searcher,
            chunks,
            llm,
            cache,
            sessions: Arc::new(SessionSources::new(1_024)),
            reranker: None,
            inflight: None,
            shadow: None,
            settings,
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionSources>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Make concurrent misses on one key wait for the first generation.
    pub fn with_inflight(mut self, registry: Arc<InflightRegistry>) -> Self {
        self.inflight = Some(registry);
        self
    }

    pub fn with_shadow(mut self, runner: ShadowRunner) -> Self {
        self.shadow = Some(runner);
        self
    }

    pub fn cache_backend(&self) -> &'static str {
        self.cache.backend_name()
    }

    /// Answer a question. Errors are returned only for failures before the
    /// stream starts; later failures arrive as `ChatEvent::Error`.
    pub async fn answer(&self, query: ChatQuery) -> Result<AnswerStream, PipelineError> {
        let mut timings = PerformanceTimings::new();

        let question = sanitize_for_prompt(&truncate_to_char_boundary(
            query.question.trim(),
            MAX_CHAT_MESSAGE_LEN,
        ));
        let requester = query.requester.trim().to_string();
        let history = validate_and_sanitize_history(query.history);

        // Follow-up turns depend on history the key does not capture
        let use_cache = history.is_empty();
        timings.set_flag("cache_bypass", !use_cache);
        timings.set_flag("rerank", self.reranker.is_some());
        timings.set_flag("inflight_dedupe", self.inflight.is_some());

        let mut lookup_key = self.lookup_key(&question, &requester)?;
        let mut inflight_guard: Option<InflightGuard> = None;

        if use_cache {
            if let Some(entry) = self.cached(&lookup_key).await {
                return Ok(self.replay(entry, timings));
            }

            if let Some(registry) = &self.inflight {
                let acquired = registry
                    .acquire(&lookup_key, self.settings.inflight_wait)
                    .await;
                match acquired {
                    Acquired::Free(guard) => inflight_guard = Some(guard),
                    Acquired::AfterWait(guard) => {
                        // The other generation may have moved this requester's source state
                        lookup_key = self.lookup_key(&question, &requester)?;
                        if let Some(entry) = self.cached(&lookup_key).await {
                            return Ok(self.replay(entry, timings));
                        }
                        inflight_guard = Some(guard);
                    }
                    Acquired::TimedOut => {
                        tracing::debug!("In-flight wait timed out for {lookup_key}");
                    }
                }
            }
        }
        timings.mark(Stage::CacheCheck);

        let retrieval = self.retrieve(&question, &mut timings).await?;

        let state = SourceState::from_chunks(retrieval.chunks.iter().map(|r| &r.chunk));
        let write_key = build_cache_key(&CacheKeyInput {
            question: &question,
            requester: &requester,
            source_tags: &state.tags,
            freshness: state.freshness,
        })?;

        let context_block = build_context_block(&retrieval.chunks);
        let messages = build_messages(build_system_prompt(), &history, &context_block, &question);
        timings.mark(Stage::PromptBuild);

        let llm_stream = self
            .llm
            .stream_chat(messages)
            .await
            .map_err(|e| GenerationError::Start(format!("{e:#}")))?;

        let sources: Vec<Citation> = retrieval.chunks.iter().map(Citation::from).collect();
        let context = ChatEvent::Context {
            sources: sources.clone(),
            cache_hit: false,
            degraded: retrieval.degraded.clone(),
        };

        let generation = Generation {
            llm: llm_stream,
            idle_timeout: self.settings.idle_timeout,
            answer: String::new(),
            timings,
            cache: use_cache.then(|| (Arc::clone(&self.cache), write_key)),
            sources,
            metrics: MetricsContext {
                model: self.llm.model_name(),
                result_count: retrieval.chunks.len(),
                degraded: retrieval.degraded.is_some(),
            },
            // Recorded when the generation settles, so waiters on the
            // in-flight marker rebuild their key against the cached entry
            session: Some((Arc::clone(&self.sessions), requester, state)),
            inflight: inflight_guard,
            finished: false,
        };

        let deltas = stream::unfold(generation, |mut generation| async move {
            let event = generation.next_event().await?;
            Some((event, generation))
        });

        Ok(Box::pin(stream::once(async move { context }).chain(deltas)))
    }

    /// Hybrid search, optional rerank and hydration, without generation.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Retrieval, PipelineError> {
        let mut timings = PerformanceTimings::new();
        self.retrieve_top(query, top_k, &mut timings).await
    }

    async fn retrieve(
        &self,
        question: &str,
        timings: &mut PerformanceTimings,
    ) -> Result<Retrieval, PipelineError> {
        self.retrieve_top(question, self.settings.top_k, timings).await
    }

    async fn retrieve_top(
        &self,
        question: &str,
        top_k: usize,
        timings: &mut PerformanceTimings,
    ) -> Result<Retrieval, PipelineError> {
        let outcome = self.searcher.search(question, top_k).await?;
        timings.mark(Stage::Search);
        tracing::debug!(
            "Hybrid search: {} semantic, {} keyword, {} merged",
            outcome.semantic_hits,
            outcome.keyword_hits,
            outcome.results.len()
        );

        if let Some(shadow) = &self.shadow {
            let main_ids = outcome.results.iter().map(|r| r.chunk_id.clone()).collect();
            // Detached: the shadow run never holds up the answer
            let _ = shadow.maybe_spawn(&self.searcher, question, main_ids);
        }

        let mut merged = outcome.results;
        if let Some(reranker) = &self.reranker {
            if !merged.is_empty() {
                self.rerank(reranker.as_ref(), question, &mut merged).await;
                timings.mark(Stage::Rerank);
            }
        }

        let chunks = self.hydrate(merged).await?;
        timings.mark(Stage::MetadataHydrate);

        Ok(Retrieval {
            chunks,
            degraded: outcome.degraded,
        })
    }

    /// Rerank failures keep the merged order.
    async fn rerank(&self, reranker: &dyn Reranker, question: &str, merged: &mut Vec<MergedResult>) {
        let ids: Vec<String> = merged.iter().map(|r| r.chunk_id.clone()).collect();
        let records = match self.chunks.fetch(&ids).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Rerank skipped, chunk text unavailable: {e:#}");
                return;
            }
        };
        let text: HashMap<&str, &str> = records
            .iter()
            .map(|c| (c.id.as_str(), c.content.as_str()))
            .collect();

        // Rerank documents index into `merged` through `positions`
        let mut documents = Vec::with_capacity(merged.len());
        let mut positions = Vec::with_capacity(merged.len());
        for (i, hit) in merged.iter().enumerate() {
            if let Some(content) = text.get(hit.chunk_id.as_str()) {
                documents.push(content.to_string());
                positions.push(i);
            }
        }

        match reranker.rerank(question, &documents).await {
            Ok(scores) => {
                let scores: Vec<RerankResult> = scores
                    .into_iter()
                    .filter_map(|r| {
                        positions.get(r.index).map(|&i| RerankResult {
                            index: i,
                            score: r.score,
                        })
                    })
                    .collect();
                apply_rerank(merged, &scores);
            }
            Err(e) => tracing::warn!("Rerank failed, keeping merged order: {e:#}"),
        }
    }

    async fn hydrate(&self, merged: Vec<MergedResult>) -> Result<Vec<RankedChunk>, PipelineError> {
        if merged.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = merged.iter().map(|r| r.chunk_id.clone()).collect();
        let records = self
            .chunks
            .fetch(&ids)
            .await
            .map_err(|e| PipelineError::Hydration(format!("{e:#}")))?;
        let mut by_id: HashMap<String, _> = records.into_iter().map(|c| (c.id.clone(), c)).collect();

        let mut ranked = Vec::with_capacity(merged.len());
        for hit in merged {
            match by_id.remove(&hit.chunk_id) {
                Some(chunk) => ranked.push(RankedChunk {
                    chunk,
                    semantic_score: hit.semantic_score,
                    keyword_score: hit.keyword_score,
                    combined_score: hit.combined_score,
                    rerank_score: hit.rerank_score,
                }),
                None => tracing::warn!("Search returned unknown chunk {}", hit.chunk_id),
            }
        }
        Ok(ranked)
    }

    fn lookup_key(&self, question: &str, requester: &str) -> Result<String, PipelineError> {
        let last = self.sessions.last(requester);
        Ok(build_cache_key(&CacheKeyInput {
            question,
            requester,
            source_tags: &last.tags,
            freshness: last.freshness,
        })?)
    }

    /// Cache errors count as misses.
    async fn cached(&self, key: &str) -> Option<CacheEntry> {
        match self.cache.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!("Cache read failed, treating as miss: {e}");
                None
            }
        }
    }

    fn replay(&self, entry: CacheEntry, mut timings: PerformanceTimings) -> AnswerStream {
        timings.cache_hit = true;
        timings.mark(Stage::CacheCheck);
        timings.mark(Stage::FirstToken);
        timings.mark(Stage::StreamComplete);

        let metrics = build_metrics(
            &timings,
            &MetricsContext {
                model: self.llm.model_name(),
                result_count: entry.sources.len(),
                degraded: false,
            },
        );
        metrics.emit();

        Box::pin(stream::iter([
            ChatEvent::Context {
                sources: entry.sources,
                cache_hit: true,
                degraded: None,
            },
            ChatEvent::Delta(entry.answer),
            ChatEvent::Done(metrics),
        ]))
    }
}

/// State carried across polls of one generation stream.
struct Generation {
    llm: ChatStream,
    idle_timeout: Duration,
    answer: String,
    timings: PerformanceTimings,
    /// None when caching is bypassed for this request
    cache: Option<(Arc<dyn ResponseCache>, String)>,
    sources: Vec<Citation>,
    metrics: MetricsContext,
    session: Option<(Arc<SessionSources>, String, SourceState)>,
    inflight: Option<InflightGuard>,
    finished: bool,
}

impl Generation {
    async fn next_event(&mut self) -> Option<ChatEvent> {
        if self.finished {
            return None;
        }
        loop {
            match tokio::time::timeout(self.idle_timeout, self.llm.next()).await {
                Ok(Some(Ok(StreamChunk::Delta(text)))) => {
                    if text.is_empty() {
                        continue;
                    }
                    if self.answer.is_empty() {
                        self.timings.mark(Stage::FirstToken);
                    }
                    self.answer.push_str(&text);
                    return Some(ChatEvent::Delta(text));
                }
                Ok(Some(Ok(StreamChunk::Usage {
                    prompt_tokens,
                    completion_tokens,
                }))) => {
                    self.timings.record_usage(prompt_tokens, completion_tokens);
                }
                Ok(Some(Err(e))) => {
                    return Some(self.fail(GenerationError::Stream(format!("{e:#}"))));
                }
                Ok(None) => return Some(self.complete().await),
                Err(_) => {
                    let secs = self.idle_timeout.as_secs();
                    return Some(self.fail(GenerationError::IdleTimeout(secs)));
                }
            }
        }
    }

    async fn complete(&mut self) -> ChatEvent {
        self.finished = true;
        self.timings.mark(Stage::StreamComplete);

        if let Some((cache, key)) = &self.cache {
            if !self.answer.is_empty() {
                let entry = CacheEntry::new(std::mem::take(&mut self.answer), self.sources.clone());
                if let Err(e) = cache.put(key, entry).await {
                    tracing::warn!("Cache write failed for {key}: {e}");
                }
            }
        }

        self.settle();

        let metrics = build_metrics(&self.timings, &self.metrics);
        metrics.emit();
        ChatEvent::Done(metrics)
    }

    fn fail(&mut self, err: GenerationError) -> ChatEvent {
        self.finished = true;
        self.settle();
        tracing::warn!("Generation failed: {err}");
        self.timings.set_flag("failed", true);
        build_metrics(&self.timings, &self.metrics).emit();
        ChatEvent::Error(err.to_string())
    }

    /// Record the requester's source state, then release the in-flight marker.
    fn settle(&mut self) {
        if let Some((sessions, requester, state)) = self.session.take() {
            sessions.record(&requester, state);
        }
        self.inflight.take();
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        self.settle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::error::CacheError;
    use crate::llm::embeddings::Embedder;
    use crate::models::{Chunk, ChunkSource, SearchCandidate};
    use crate::search::hybrid::HybridWeights;
    use crate::search::{KeywordIndex, SemanticIndex};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ─── Mocks ───────────────────────────────────────────

    #[derive(Default)]
    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct StaticSemantic(Result<Vec<SearchCandidate>, String>);

    #[async_trait]
    impl SemanticIndex for StaticSemantic {
        async fn search(&self, _: &[f32], _: usize) -> anyhow::Result<Vec<SearchCandidate>> {
            self.0.clone().map_err(anyhow::Error::msg)
        }
    }

    struct StaticKeyword(Result<Vec<SearchCandidate>, String>);

    #[async_trait]
    impl KeywordIndex for StaticKeyword {
        async fn search(&self, _: &str, _: usize) -> anyhow::Result<Vec<SearchCandidate>> {
            self.0.clone().map_err(anyhow::Error::msg)
        }
    }

    struct Lookup(Vec<Chunk>);

    #[async_trait]
    impl ChunkLookup for Lookup {
        async fn fetch(&self, ids: &[String]) -> anyhow::Result<Vec<Chunk>> {
            Ok(ids
                .iter()
                .filter_map(|id| self.0.iter().find(|c| &c.id == id).cloned())
                .collect())
        }
    }

    enum Script {
        Answer(Vec<&'static str>),
        FailAfter(&'static str),
        StallAfter(&'static str),
        Delayed(&'static str, Duration),
    }

    struct ScriptedLlm {
        script: Script,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedLlm {
        async fn stream_chat(&self, _: Vec<ChatMessage>) -> anyhow::Result<ChatStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let stream: ChatStream = match &self.script {
                Script::Answer(parts) => {
                    let mut items: Vec<anyhow::Result<StreamChunk>> = parts
                        .iter()
                        .map(|p| Ok(StreamChunk::Delta(p.to_string())))
                        .collect();
                    items.push(Ok(StreamChunk::Usage {
                        prompt_tokens: 50,
                        completion_tokens: parts.len() as u32,
                    }));
                    Box::pin(stream::iter(items))
                }
                Script::FailAfter(first) => Box::pin(stream::iter(vec![
                    Ok(StreamChunk::Delta(first.to_string())),
                    Err(anyhow::anyhow!("connection reset")),
                ])),
                Script::StallAfter(first) => Box::pin(
                    stream::iter(vec![Ok(StreamChunk::Delta(first.to_string()))])
                        .chain(stream::pending()),
                ),
                Script::Delayed(text, delay) => {
                    let (text, delay) = (text.to_string(), *delay);
                    Box::pin(stream::once(async move {
                        tokio::time::sleep(delay).await;
                        Ok(StreamChunk::Delta(text))
                    }))
                }
            };
            Ok(stream)
        }

        fn model_name(&self) -> String {
            "scripted".into()
        }
    }

    /// Scores documents in reverse order after a fixed delay.
    struct SlowReranker(Duration);

    #[async_trait]
    impl Reranker for SlowReranker {
        async fn rerank(&self, _: &str, documents: &[String]) -> anyhow::Result<Vec<RerankResult>> {
            tokio::time::sleep(self.0).await;
            Ok((0..documents.len())
                .map(|index| RerankResult {
                    index,
                    score: index as f32,
                })
                .collect())
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl ResponseCache for BrokenCache {
        async fn get(&self, _: &str) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn put(&self, _: &str, _: CacheEntry) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        fn backend_name(&self) -> &'static str {
            "broken"
        }
    }

    // ─── Fixtures ────────────────────────────────────────

    fn upload_chunk(id: &str, content: &str) -> Chunk {
        Chunk {
            id: id.into(),
            document_id: "doc-1".into(),
            document_title: "Volunteer Handbook".into(),
            content: content.into(),
            source: ChunkSource::Upload {
                filename: Some("handbook.pdf".into()),
                mime_type: None,
            },
        }
    }

    struct Harness {
        pipeline: ChatPipeline,
        llm: Arc<ScriptedLlm>,
        embedder: Arc<CountingEmbedder>,
        cache: Arc<MemoryCache>,
    }

    fn harness(script: Script) -> Harness {
        harness_with(
            script,
            Ok(vec![SearchCandidate::semantic("c1", 0.9)]),
            Ok(vec![SearchCandidate::keyword("c1", 4.0)]),
        )
    }

    fn harness_with(
        script: Script,
        semantic: Result<Vec<SearchCandidate>, String>,
        keyword: Result<Vec<SearchCandidate>, String>,
    ) -> Harness {
        let embedder = Arc::new(CountingEmbedder::default());
        let searcher = HybridSearcher::new(
            embedder.clone(),
            Arc::new(StaticSemantic(semantic)),
            Arc::new(StaticKeyword(keyword)),
            HybridWeights::default(),
        );
        let llm = ScriptedLlm::new(script);
        let cache = Arc::new(MemoryCache::new(100, Duration::from_secs(3600)));
        let lookup = Arc::new(Lookup(vec![upload_chunk(
            "c1",
            "Volunteers arrive 30 minutes early.",
        )]));
        let pipeline = ChatPipeline::new(
            searcher,
            lookup,
            llm.clone(),
            cache.clone(),
            PipelineSettings::default(),
        );
        Harness {
            pipeline,
            llm,
            embedder,
            cache,
        }
    }

    fn query(question: &str) -> ChatQuery {
        ChatQuery {
            question: question.into(),
            requester: "user-7".into(),
            history: None,
        }
    }

    async fn collect(pipeline: &ChatPipeline, q: ChatQuery) -> Vec<ChatEvent> {
        pipeline.answer(q).await.unwrap().collect().await
    }

    // ─── Tests ───────────────────────────────────────────

    #[tokio::test]
    async fn test_cache_hit_skips_search_and_generation() {
        let h = harness(Script::Answer(vec!["unused"]));
        let key = build_cache_key(&CacheKeyInput {
            question: "When do volunteers arrive?",
            requester: "user-7",
            source_tags: &BTreeSet::new(),
            freshness: None,
        })
        .unwrap();
        h.cache
            .put(&key, CacheEntry::new("Thirty minutes early.", vec![]))
            .await
            .unwrap();

        let events = collect(&h.pipeline, query("  when do VOLUNTEERS arrive? ")).await;

        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ChatEvent::Context { cache_hit: true, .. }));
        match &events[1] {
            ChatEvent::Delta(text) => assert_eq!(text, "Thirty minutes early."),
            other => panic!("expected delta, got {other:?}"),
        }
        match &events[2] {
            ChatEvent::Done(m) => assert!(m.cache_hit),
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_completed_answer_is_cached_and_replayed() {
        let h = harness(Script::Answer(vec!["Thirty ", "minutes early."]));

        let first = collect(&h.pipeline, query("When do volunteers arrive?")).await;
        assert!(matches!(first[0], ChatEvent::Context { cache_hit: false, .. }));
        match first.last() {
            Some(ChatEvent::Done(m)) => {
                assert!(!m.cache_hit);
                assert_eq!(m.completion_tokens, 2);
                assert_eq!(m.result_count, 1);
            }
            other => panic!("expected done, got {other:?}"),
        }
        assert_eq!(h.cache.len(), 1);

        let second = collect(&h.pipeline, query("when do volunteers arrive?")).await;
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);
        match &second[1] {
            ChatEvent::Delta(text) => assert_eq!(text, "Thirty minutes early."),
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_failure_is_not_cached() {
        let h = harness(Script::FailAfter("Thirty"));
        let events = collect(&h.pipeline, query("When do volunteers arrive?")).await;
        assert!(matches!(events.last(), Some(ChatEvent::Error(_))));
        assert!(h.cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_is_not_cached() {
        let h = harness(Script::StallAfter("Thirty"));
        let events = collect(&h.pipeline, query("When do volunteers arrive?")).await;
        match events.last() {
            Some(ChatEvent::Error(msg)) => assert!(msg.contains("stalled")),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_stream_is_not_cached() {
        let h = harness(Script::Answer(vec!["Thirty ", "minutes ", "early."]));
        let mut stream = h.pipeline.answer(query("When do volunteers arrive?")).await.unwrap();
        let _context = stream.next().await;
        let _first_delta = stream.next().await;
        drop(stream);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_history_bypasses_cache() {
        let h = harness(Script::Answer(vec!["Yes."]));
        let mut q = query("And on Easter?");
        q.history = Some(vec![
            ChatMessage {
                role: "user".into(),
                content: "When do volunteers arrive?".into(),
            },
            ChatMessage {
                role: "assistant".into(),
                content: "Thirty minutes early.".into(),
            },
        ]);
        collect(&h.pipeline, q.clone()).await;
        collect(&h.pipeline, q).await;
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 2);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let h = harness(Script::Answer(vec!["x"]));
        let err = h.pipeline.answer(query("   ")).await.err().unwrap();
        assert!(matches!(err, PipelineError::Normalization(_)));
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_both_backends_failing_is_an_error() {
        let h = harness_with(
            Script::Answer(vec!["x"]),
            Err("vector db down".into()),
            Err("index locked".into()),
        );
        let err = h.pipeline.answer(query("anything")).await.err().unwrap();
        assert!(matches!(err, PipelineError::Search(_)));
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_degraded_search_still_answers() {
        let h = harness_with(
            Script::Answer(vec!["ok"]),
            Ok(vec![SearchCandidate::semantic("c1", 0.8)]),
            Err("index locked".into()),
        );
        let events = collect(&h.pipeline, query("When do volunteers arrive?")).await;
        match &events[0] {
            ChatEvent::Context { degraded, sources, .. } => {
                assert!(matches!(degraded, Some(Degradation::Keyword(_))));
                assert_eq!(sources.len(), 1);
            }
            other => panic!("expected context, got {other:?}"),
        }
        assert!(matches!(events.last(), Some(ChatEvent::Done(_))));
    }

    #[tokio::test]
    async fn test_broken_cache_fails_open() {
        let embedder = Arc::new(CountingEmbedder::default());
        let searcher = HybridSearcher::new(
            embedder,
            Arc::new(StaticSemantic(Ok(vec![SearchCandidate::semantic("c1", 0.9)]))),
            Arc::new(StaticKeyword(Ok(vec![]))),
            HybridWeights::default(),
        );
        let llm = ScriptedLlm::new(Script::Answer(vec!["fine"]));
        let pipeline = ChatPipeline::new(
            searcher,
            Arc::new(Lookup(vec![upload_chunk("c1", "text")])),
            llm.clone(),
            Arc::new(BrokenCache),
            PipelineSettings::default(),
        );
        let events = collect(&pipeline, query("q")).await;
        assert!(matches!(events.last(), Some(ChatEvent::Done(_))));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stage_marks_are_monotonic() {
        let h = harness(Script::Answer(vec!["a", "b"]));
        let events = collect(&h.pipeline, query("When do volunteers arrive?")).await;
        let Some(ChatEvent::Done(m)) = events.last() else {
            panic!("expected done");
        };
        let order = [
            "cache_check",
            "search",
            "metadata_hydrate",
            "prompt_build",
            "first_token",
            "stream_complete",
        ];
        let marks: Vec<u64> = order.iter().map(|s| m.stages_ms[s]).collect();
        assert!(marks.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(m.stages_ms["rerank"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_marks_are_monotonic_with_rerank() {
        let h = harness_with(
            Script::Answer(vec!["a"]),
            Ok(vec![
                SearchCandidate::semantic("c1", 0.9),
                SearchCandidate::semantic("c2", 0.4),
            ]),
            Ok(vec![SearchCandidate::keyword("c1", 4.0)]),
        );
        let pipeline = h
            .pipeline
            .clone()
            .with_reranker(Arc::new(SlowReranker(Duration::from_millis(40))));

        let events = collect(&pipeline, query("When do volunteers arrive?")).await;
        let Some(ChatEvent::Done(m)) = events.last() else {
            panic!("expected done");
        };
        let order = [
            "cache_check",
            "search",
            "rerank",
            "metadata_hydrate",
            "prompt_build",
            "first_token",
            "stream_complete",
        ];
        let marks: Vec<u64> = order.iter().map(|s| m.stages_ms[s]).collect();
        assert!(marks.windows(2).all(|w| w[0] <= w[1]), "{marks:?}");
        assert!(m.stages_ms["rerank"] >= 40);
        assert_eq!(m.flags.get("rerank"), Some(&true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_generate_once_with_inflight_marker() {
        let h = harness(Script::Delayed("Thirty minutes early.", Duration::from_millis(200)));
        let pipeline = h.pipeline.clone().with_inflight(InflightRegistry::new());

        let first = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { collect(&pipeline, query("When do volunteers arrive?")).await })
        };
        // Let the first request take the marker and start generating
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);

        let second = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { collect(&pipeline, query("when do volunteers ARRIVE?")).await })
        };

        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(first[0], ChatEvent::Context { cache_hit: false, .. }));
        assert!(matches!(second[0], ChatEvent::Context { cache_hit: true, .. }));
        match &second[1] {
            ChatEvent::Delta(text) => assert_eq!(text, "Thirty minutes early."),
            other => panic!("expected cached delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_source_state_recorded_when_generation_settles() {
        let h = harness(Script::Answer(vec!["Thirty ", "minutes early."]));
        let mut stream = h.pipeline.answer(query("When do volunteers arrive?")).await.unwrap();
        let _context = stream.next().await;
        assert!(h.pipeline.sessions.last("user-7").tags.is_empty());

        while stream.next().await.is_some() {}
        assert!(h.pipeline.sessions.last("user-7").tags.contains("upload"));
    }
}
