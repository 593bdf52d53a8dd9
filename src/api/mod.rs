pub mod chat;
pub mod documents;
pub mod health;
pub mod search;

use axum::http::StatusCode;

use crate::error::PipelineError;

/// Bad input is the caller's fault; everything else is an upstream failure.
pub(crate) fn pipeline_error(err: PipelineError) -> (StatusCode, String) {
    let status = match &err {
        PipelineError::Normalization(_) => StatusCode::BAD_REQUEST,
        PipelineError::Search(_) | PipelineError::Hydration(_) | PipelineError::Generation(_) => {
            StatusCode::BAD_GATEWAY
        }
    };
    (status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GenerationError, NormalizationError, SearchError};

    #[test]
    fn test_normalization_is_bad_request() {
        let (status, msg) = pipeline_error(NormalizationError::EmptyRequester.into());
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(msg.contains("requester"));
    }

    #[test]
    fn test_backend_failures_are_bad_gateway() {
        let search = SearchError::BackendsFailed {
            semantic: "a".into(),
            keyword: "b".into(),
        };
        assert_eq!(pipeline_error(search.into()).0, StatusCode::BAD_GATEWAY);
        let start = GenerationError::Start("refused".into());
        assert_eq!(pipeline_error(start.into()).0, StatusCode::BAD_GATEWAY);
    }
}
