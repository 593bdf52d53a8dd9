use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{ConfigError, SearchError};
use crate::llm::embeddings::Embedder;
use crate::models::{Degradation, MergedResult, SearchCandidate};
use crate::search::{KeywordIndex, SemanticIndex};

/// Linear weights for the two score sources. Always sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridWeights {
    semantic: f32,
    keyword: f32,
}

impl HybridWeights {
    /// Rescales the pair so it sums to 1. Rejects negative, non-finite or
    /// all-zero weights.
    pub fn new(semantic: f32, keyword: f32) -> Result<Self, ConfigError> {
        if !semantic.is_finite() || !keyword.is_finite() {
            return Err(ConfigError::InvalidWeights("weights must be finite".into()));
        }
        if semantic < 0.0 || keyword < 0.0 {
            return Err(ConfigError::InvalidWeights(format!(
                "weights must be non-negative (semantic {semantic}, keyword {keyword})"
            )));
        }
        let total = semantic + keyword;
        if total <= 0.0 {
            return Err(ConfigError::InvalidWeights("at least one weight must be positive".into()));
        }
        let semantic = semantic / total;
        Ok(Self {
            semantic,
            keyword: 1.0 - semantic,
        })
    }

    pub fn semantic(&self) -> f32 {
        self.semantic
    }

    pub fn keyword(&self) -> f32 {
        self.keyword
    }
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            semantic: 0.7,
            keyword: 0.3,
        }
    }
}

/// Collapse duplicate ids (keeping the best raw score) and min-max scale
/// into [0,1]. A list whose scores are all equal maps every member to 1.
fn normalize(candidates: &[SearchCandidate]) -> HashMap<&str, f32> {
    let mut best: HashMap<&str, f32> = HashMap::new();
    for c in candidates.iter().filter(|c| c.score.is_finite()) {
        best.entry(c.chunk_id.as_str())
            .and_modify(|s| *s = s.max(c.score))
            .or_insert(c.score);
    }

    let (min, max) = best
        .values()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &s| (lo.min(s), hi.max(s)));
    let range = max - min;

    best.into_iter()
        .map(|(id, s)| {
            let norm = if range > f32::EPSILON { (s - min) / range } else { 1.0 };
            (id, norm)
        })
        .collect()
}

/// Weighted merge of semantic and keyword candidates.
///
/// Each list is normalized on its own, then
/// `combined = w_semantic * semantic + w_keyword * keyword`, with 0 for the
/// list a chunk is missing from. Ordered by combined score, ties broken by
/// the semantic score and then by chunk id. No chunk id appears twice.
pub fn merge_candidates(
    semantic: &[SearchCandidate],
    keyword: &[SearchCandidate],
    weights: HybridWeights,
    top_k: usize,
) -> Vec<MergedResult> {
    let sem = normalize(semantic);
    let kw = normalize(keyword);

    let mut union: BTreeMap<&str, (Option<f32>, Option<f32>)> = BTreeMap::new();
    for (id, s) in &sem {
        union.entry(*id).or_default().0 = Some(*s);
    }
    for (id, k) in &kw {
        union.entry(*id).or_default().1 = Some(*k);
    }

    let mut merged: Vec<MergedResult> = union
        .into_iter()
        .map(|(id, scores)| {
            let combined = match scores {
                (Some(s), Some(k)) => weights.semantic * s + weights.keyword * k,
                (Some(s), None) => weights.semantic * s,
                (None, Some(k)) => weights.keyword * k,
                (None, None) => 0.0,
            };
            MergedResult {
                chunk_id: id.to_string(),
                semantic_score: scores.0.unwrap_or(0.0),
                keyword_score: scores.1.unwrap_or(0.0),
                combined_score: combined,
                rerank_score: None,
            }
        })
        .collect();

    merged.sort_by(|a, b| {
        b.combined_score
            .total_cmp(&a.combined_score)
            .then_with(|| b.semantic_score.total_cmp(&a.semantic_score))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    merged.truncate(top_k);
    merged
}

/// Result of one hybrid search.
#[derive(Debug, Clone)]
pub struct HybridOutcome {
    pub results: Vec<MergedResult>,
    /// Set when one backend failed and the results come from the other only.
    pub degraded: Option<Degradation>,
    pub semantic_hits: usize,
    pub keyword_hits: usize,
}

/// Runs the semantic and keyword backends concurrently and merges them.
#[derive(Clone)]
pub struct HybridSearcher {
    embedder: Arc<dyn Embedder>,
    semantic: Arc<dyn SemanticIndex>,
    keyword: Arc<dyn KeywordIndex>,
    weights: HybridWeights,
    fetch_multiplier: usize,
}

impl HybridSearcher {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        semantic: Arc<dyn SemanticIndex>,
        keyword: Arc<dyn KeywordIndex>,
        weights: HybridWeights,
    ) -> Self {
        Self {
            embedder,
            semantic,
            keyword,
            weights,
            fetch_multiplier: 3,
        }
    }

    /// Each backend is asked for `top_k * multiplier` candidates.
    pub fn with_fetch_multiplier(mut self, multiplier: usize) -> Self {
        self.fetch_multiplier = multiplier.max(1);
        self
    }

    /// Same backends, different weighting.
    pub fn with_weights(&self, weights: HybridWeights) -> Self {
        Self {
            weights,
            ..self.clone()
        }
    }

    pub fn weights(&self) -> HybridWeights {
        self.weights
    }

    /// Empty results are a valid answer; an error means both backends failed.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<HybridOutcome, SearchError> {
        let fetch = top_k.saturating_mul(self.fetch_multiplier);

        let semantic = async {
            let embedding = self.embedder.embed(query).await?;
            self.semantic.search(&embedding, fetch).await
        };
        let keyword = self.keyword.search(query, fetch);

        let (semantic, keyword) = tokio::join!(semantic, keyword);

        let (semantic, keyword, degraded) = match (semantic, keyword) {
            (Ok(s), Ok(k)) => (s, k, None),
            (Ok(s), Err(e)) => {
                tracing::warn!("Keyword search failed, using semantic results only: {e:#}");
                (s, Vec::new(), Some(Degradation::Keyword(format!("{e:#}"))))
            }
            (Err(e), Ok(k)) => {
                tracing::warn!("Semantic search failed, using keyword results only: {e:#}");
                (Vec::new(), k, Some(Degradation::Semantic(format!("{e:#}"))))
            }
            (Err(se), Err(ke)) => {
                return Err(SearchError::BackendsFailed {
                    semantic: format!("{se:#}"),
                    keyword: format!("{ke:#}"),
                });
            }
        };

        let results = merge_candidates(&semantic, &keyword, self.weights, top_k);
        Ok(HybridOutcome {
            results,
            degraded,
            semantic_hits: semantic.len(),
            keyword_hits: keyword.len(),
        })
    }
}
