use rand::Rng;
use std::collections::HashSet;
use tokio::task::JoinHandle;

use crate::config::ShadowConfig;
use crate::error::ConfigError;
use crate::search::hybrid::{HybridSearcher, HybridWeights};

/// True with probability `sample_rate`, clamped to [0, 1].
pub fn should_run_shadow_test(sample_rate: f64) -> bool {
    if sample_rate.is_nan() || sample_rate <= 0.0 {
        return false;
    }
    if sample_rate >= 1.0 {
        return true;
    }
    rand::thread_rng().gen_bool(sample_rate)
}

/// Percentage of `main` ids that also appear in `shadow`, in [0, 100].
/// An empty main set yields 0.
pub fn calculate_chunk_overlap<S: AsRef<str>>(shadow: &[S], main: &[S]) -> f64 {
    let main: HashSet<&str> = main.iter().map(AsRef::as_ref).collect();
    if main.is_empty() {
        return 0.0;
    }
    let shadow: HashSet<&str> = shadow.iter().map(AsRef::as_ref).collect();
    let shared = main.intersection(&shadow).count();
    (shared as f64 / main.len() as f64 * 100.0).clamp(0.0, 100.0)
}

/// Runs an alternate retrieval configuration on a sample of requests and
/// logs how much its results overlap the ones the user got.
#[derive(Debug, Clone)]
pub struct ShadowRunner {
    sample_rate: f64,
    top_k: usize,
    weights: HybridWeights,
}

impl ShadowRunner {
    pub fn new(sample_rate: f64, top_k: usize, weights: HybridWeights) -> Self {
        Self {
            sample_rate,
            top_k: top_k.max(1),
            weights,
        }
    }

    pub fn from_config(config: &ShadowConfig) -> Result<Self, ConfigError> {
        let weights = HybridWeights::new(config.semantic_weight, 1.0 - config.semantic_weight)?;
        Ok(Self::new(config.sample_rate, config.top_k, weights))
    }

    /// Detached; `None` when this request was not sampled. The handle is
    /// only for tests; callers normally drop it.
    pub fn maybe_spawn(
        &self,
        searcher: &HybridSearcher,
        query: &str,
        main_ids: Vec<String>,
    ) -> Option<JoinHandle<()>> {
        if !should_run_shadow_test(self.sample_rate) {
            return None;
        }

        let shadow_searcher = searcher.with_weights(self.weights);
        let query = query.to_string();
        let top_k = self.top_k;
        let weights = self.weights;

        Some(tokio::spawn(async move {
            match shadow_searcher.search(&query, top_k).await {
                Ok(outcome) => {
                    let shadow_ids: Vec<String> =
                        outcome.results.into_iter().map(|r| r.chunk_id).collect();
                    let overlap = calculate_chunk_overlap(&shadow_ids, &main_ids);
                    tracing::info!(
                        target: "patmos::shadow",
                        overlap_pct = overlap,
                        main_count = main_ids.len(),
                        shadow_count = shadow_ids.len(),
                        shadow_top_k = top_k,
                        shadow_semantic_weight = weights.semantic(),
                        degraded = outcome.degraded.is_some(),
                        "shadow retrieval compared"
                    );
                }
                Err(e) => {
                    tracing::warn!(target: "patmos::shadow", "Shadow retrieval failed: {e}");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rate_never_runs() {
        assert!((0..1000).all(|_| !should_run_shadow_test(0.0)));
    }

    #[test]
    fn test_full_rate_always_runs() {
        assert!((0..1000).all(|_| should_run_shadow_test(1.0)));
    }

    #[test]
    fn test_out_of_range_rates_clamp() {
        assert!(!should_run_shadow_test(-3.0));
        assert!(!should_run_shadow_test(f64::NAN));
        assert!(should_run_shadow_test(7.5));
    }

    #[test]
    fn test_overlap_empty_main_is_zero() {
        let none: [&str; 0] = [];
        assert_eq!(calculate_chunk_overlap(&["a", "b"], &none), 0.0);
        assert_eq!(calculate_chunk_overlap(&none, &none), 0.0);
    }

    #[test]
    fn test_overlap_partial() {
        let overlap = calculate_chunk_overlap(&["a", "x", "y"], &["a", "b", "c", "d"]);
        assert!((overlap - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_overlap_bounds() {
        let main = ["a", "b"];
        assert_eq!(calculate_chunk_overlap(&["a", "b", "c", "d"], &main), 100.0);
        assert_eq!(calculate_chunk_overlap(&["z"], &main), 0.0);
        // Duplicate ids count once
        let dup_main = ["a", "a", "b"];
        let o = calculate_chunk_overlap(&["a", "a"], &dup_main);
        assert!((0.0..=100.0).contains(&o));
        assert!((o - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_from_config_weights() {
        let runner = ShadowRunner::from_config(&ShadowConfig::default()).unwrap();
        assert!((runner.weights.semantic() - 0.5).abs() < 1e-6);
        assert_eq!(runner.top_k, 12);
    }

    #[test]
    fn test_from_config_rejects_bad_weight() {
        let config = ShadowConfig {
            semantic_weight: 1.5,
            ..ShadowConfig::default()
        };
        assert!(ShadowRunner::from_config(&config).is_err());
    }
}
