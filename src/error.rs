//! Error taxonomy for the retrieval and caching core.
//!
//! Backend adapters (HTTP clients, tantivy) work in `anyhow` and are
//! converted into these types where they cross into the pipeline.

use thiserror::Error;

/// Both halves of a hybrid search failed. A single failing half is not an
/// error: it is reported as a degradation on the search outcome.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SearchError {
    #[error("semantic and keyword search both failed (semantic: {semantic}; keyword: {keyword})")]
    BackendsFailed { semantic: String, keyword: String },
}

/// The cache store could not serve a request. Callers treat this as a miss.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache entry could not be decoded: {0}")]
    Corrupt(String),
}

/// Malformed query input, rejected before any backend is contacted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("question text is empty")]
    EmptyQuestion,

    #[error("requester identifier is empty")]
    EmptyRequester,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("failed to start generation: {0}")]
    Start(String),

    #[error("generation stream failed: {0}")]
    Stream(String),

    #[error("generation stalled for {0}s without output")]
    IdleTimeout(u64),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid hybrid weights: {0}")]
    InvalidWeights(String),
}

/// Errors surfaced by the chat pipeline before its answer stream starts.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("chunk metadata lookup failed: {0}")]
    Hydration(String),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backends_failed_names_both_causes() {
        let err = SearchError::BackendsFailed {
            semantic: "embed timeout".into(),
            keyword: "index locked".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("embed timeout"));
        assert!(msg.contains("index locked"));
    }

    #[test]
    fn test_pipeline_error_is_transparent() {
        let err: PipelineError = NormalizationError::EmptyQuestion.into();
        assert_eq!(err.to_string(), "question text is empty");
    }
}
