//! Cross-encoder reranker via OpenAI-compatible `/v1/rerank` endpoint.
//!
//! Sends a single batch request with all query-document pairs. The merged
//! hybrid order is blended with the cross-encoder score, trusting the
//! merge more near the top of the list.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RerankerConfig;
use crate::models::MergedResult;

/// Result of reranking a single document.
#[derive(Debug, Clone)]
pub struct RerankResult {
    /// Index into the original documents array.
    pub index: usize,
    /// Relevance score (0.0 - 1.0 after sigmoid normalization).
    pub score: f32,
}

/// Scores documents against a query.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<RerankResult>>;
}

pub struct CrossEncoderReranker {
    client: reqwest::Client,
    config: RerankerConfig,
}

impl CrossEncoderReranker {
    /// None when no sidecar URL is configured.
    pub fn from_config(client: reqwest::Client, config: &RerankerConfig) -> Option<Self> {
        config.base_url.as_ref()?;
        Some(Self {
            client,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<RerankResult>> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .context("Reranker base_url not configured")?;
        let model = self.config.model.as_deref().unwrap_or("default");
        let url = format!("{}/v1/rerank", base_url.trim_end_matches('/'));

        let req_body = RerankRequest {
            model: model.to_string(),
            query: query.to_string(),
            documents: documents.to_vec(),
            top_n: documents.len(),
        };

        let timeout = std::time::Duration::from_secs(self.config.timeout_secs.min(30));

        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&req_body)
            .send()
            .await
            .context("Failed to reach reranker endpoint")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Reranker returned {status}: {body}");
        }

        let body: RerankResponse = resp
            .json()
            .await
            .context("Failed to parse reranker response")?;

        let mut results: Vec<RerankResult> = body
            .results
            .into_iter()
            .filter(|r| r.index < documents.len())
            .map(|r| RerankResult {
                index: r.index,
                score: sigmoid(r.relevance_score),
            })
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(results)
    }
}

/// Sigmoid normalization: maps raw logits to 0-1 range.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Attach rerank scores and reorder with a position-aware blend:
/// top 1-3 keep 75% of the merged score, 4-10 keep 60%, the rest 40%.
/// Results the reranker did not score keep their merged score.
pub fn apply_rerank(results: &mut Vec<MergedResult>, scores: &[RerankResult]) {
    for r in scores {
        if let Some(hit) = results.get_mut(r.index) {
            hit.rerank_score = Some(r.score);
        }
    }

    let mut blended: Vec<(f32, MergedResult)> = results
        .drain(..)
        .enumerate()
        .map(|(i, hit)| {
            let score = match hit.rerank_score {
                Some(rerank) => {
                    let (merge_w, rerank_w) = if i < 3 {
                        (0.75, 0.25)
                    } else if i < 10 {
                        (0.60, 0.40)
                    } else {
                        (0.40, 0.60)
                    };
                    merge_w * hit.combined_score + rerank_w * rerank
                }
                None => hit.combined_score,
            };
            (score, hit)
        })
        .collect();

    // Stable sort keeps merge order among equal blends
    blended.sort_by(|a, b| b.0.total_cmp(&a.0));
    results.extend(blended.into_iter().map(|(_, hit)| hit));
}

// ─── Request/Response types ────────────────────────────

#[derive(Serialize)]
struct RerankRequest {
    model: String,
    query: String,
    documents: Vec<String>,
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultRaw>,
}

#[derive(Deserialize)]
struct RerankResultRaw {
    index: usize,
    relevance_score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged(id: &str, combined: f32) -> MergedResult {
        MergedResult {
            chunk_id: id.into(),
            semantic_score: combined,
            keyword_score: 0.0,
            combined_score: combined,
            rerank_score: None,
        }
    }

    #[test]
    fn test_sigmoid_zero() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sigmoid_extremes() {
        assert!(sigmoid(10.0) > 0.999);
        assert!(sigmoid(-10.0) < 0.001);
    }

    #[test]
    fn test_sigmoid_symmetry() {
        let x = 2.5f32;
        assert!((sigmoid(x) + sigmoid(-x) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_apply_rerank_can_promote() {
        let mut results = vec![merged("a", 0.60), merged("b", 0.55)];
        let scores = vec![
            RerankResult { index: 1, score: 0.99 },
            RerankResult { index: 0, score: 0.01 },
        ];
        apply_rerank(&mut results, &scores);
        assert_eq!(results[0].chunk_id, "b");
        assert_eq!(results[0].rerank_score, Some(0.99));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_apply_rerank_ignores_out_of_range_index() {
        let mut results = vec![merged("a", 0.5)];
        apply_rerank(&mut results, &[RerankResult { index: 7, score: 1.0 }]);
        assert_eq!(results[0].rerank_score, None);
        assert_eq!(results[0].combined_score, 0.5);
    }

    #[test]
    fn test_from_config_requires_url() {
        let config = RerankerConfig::default();
        assert!(CrossEncoderReranker::from_config(reqwest::Client::new(), &config).is_none());
    }
}
