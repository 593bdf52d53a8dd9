use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Pipeline stages, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    CacheCheck,
    Search,
    Rerank,
    MetadataHydrate,
    PromptBuild,
    FirstToken,
    StreamComplete,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::CacheCheck,
        Stage::Search,
        Stage::Rerank,
        Stage::MetadataHydrate,
        Stage::PromptBuild,
        Stage::FirstToken,
        Stage::StreamComplete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::CacheCheck => "cache_check",
            Stage::Search => "search",
            Stage::Rerank => "rerank",
            Stage::MetadataHydrate => "metadata_hydrate",
            Stage::PromptBuild => "prompt_build",
            Stage::FirstToken => "first_token",
            Stage::StreamComplete => "stream_complete",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Timing record for one chat request.
///
/// Stage marks are offsets from construction on a monotonic clock, so they
/// never go backwards even if the wall clock is adjusted mid-request.
#[derive(Debug, Clone)]
pub struct PerformanceTimings {
    pub started_at: DateTime<Utc>,
    origin: Instant,
    stages: [Option<Duration>; 7],
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub flags: BTreeMap<String, bool>,
    pub cache_hit: bool,
}

impl PerformanceTimings {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            origin: Instant::now(),
            stages: [None; 7],
            prompt_tokens: 0,
            completion_tokens: 0,
            flags: BTreeMap::new(),
            cache_hit: false,
        }
    }

    /// Record that `stage` just finished.
    pub fn mark(&mut self, stage: Stage) {
        self.stages[stage.index()] = Some(self.origin.elapsed());
    }

    /// Offset of a stage from the start, if it ran.
    pub fn stage(&self, stage: Stage) -> Option<Duration> {
        self.stages[stage.index()]
    }

    pub fn set_flag(&mut self, name: &str, enabled: bool) {
        self.flags.insert(name.to_string(), enabled);
    }

    pub fn record_usage(&mut self, prompt_tokens: u32, completion_tokens: u32) {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Stages that ran are non-decreasing in stage order.
    pub fn is_monotonic(&self) -> bool {
        let ran: Vec<Duration> = self.stages.iter().flatten().copied().collect();
        ran.windows(2).all(|w| w[0] <= w[1])
    }
}

impl Default for PerformanceTimings {
    fn default() -> Self {
        Self::new()
    }
}

/// Request facts not captured by the timing record itself.
#[derive(Debug, Clone, Default)]
pub struct MetricsContext {
    pub model: String,
    pub result_count: usize,
    pub degraded: bool,
}

/// Finalized metrics for one request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetrics {
    pub request_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// First token minus start
    pub first_token_latency_ms: Option<u64>,
    /// Stream complete minus first token
    pub time_to_last_token_ms: Option<u64>,
    pub total_ms: u64,
    /// Offset of each stage from the start; 0 for stages that did not run
    pub stages_ms: BTreeMap<&'static str, u64>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub tokens_per_second: Option<f64>,
    pub flags: BTreeMap<String, bool>,
    pub cache_hit: bool,
    pub model: String,
    pub result_count: usize,
    pub degraded: bool,
}

pub fn build_metrics(timings: &PerformanceTimings, ctx: &MetricsContext) -> RequestMetrics {
    let first_token = timings.stage(Stage::FirstToken);
    let complete = timings.stage(Stage::StreamComplete);

    let time_to_last_token = match (first_token, complete) {
        (Some(first), Some(done)) => Some(done.saturating_sub(first)),
        _ => None,
    };

    let tokens_per_second = time_to_last_token
        .filter(|d| !d.is_zero() && timings.completion_tokens > 0)
        .map(|d| f64::from(timings.completion_tokens) / d.as_secs_f64());

    let stages_ms = Stage::ALL
        .iter()
        .map(|s| (s.as_str(), timings.stage(*s).map_or(0, as_millis)))
        .collect();

    RequestMetrics {
        request_id: Uuid::new_v4(),
        started_at: timings.started_at,
        first_token_latency_ms: first_token.map(as_millis),
        time_to_last_token_ms: time_to_last_token.map(as_millis),
        total_ms: complete.map_or_else(|| as_millis(timings.elapsed()), as_millis),
        stages_ms,
        prompt_tokens: timings.prompt_tokens,
        completion_tokens: timings.completion_tokens,
        tokens_per_second,
        flags: timings.flags.clone(),
        cache_hit: timings.cache_hit,
        model: ctx.model.clone(),
        result_count: ctx.result_count,
        degraded: ctx.degraded,
    }
}

fn as_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl RequestMetrics {
    pub fn emit(&self) {
        tracing::info!(
            target: "patmos::perf",
            request_id = %self.request_id,
            first_token_latency_ms = ?self.first_token_latency_ms,
            time_to_last_token_ms = ?self.time_to_last_token_ms,
            total_ms = self.total_ms,
            stages = ?self.stages_ms,
            prompt_tokens = self.prompt_tokens,
            completion_tokens = self.completion_tokens,
            tokens_per_second = ?self.tokens_per_second,
            flags = ?self.flags,
            cache_hit = self.cache_hit,
            model = %self.model,
            result_count = self.result_count,
            degraded = self.degraded,
            "request metrics"
        );
    }
}
