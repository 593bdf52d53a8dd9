use std::convert::Infallible;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{Stream, StreamExt};
use serde_json::json;

use super::pipeline_error;
use crate::models::ChatRequest;
use crate::pipeline::{ChatEvent, ChatQuery};
use crate::state::AppState;

/// POST /api/chat - RAG chat endpoint with SSE streaming.
///
/// Events: `context` (sources, cache hit, degradation), `delta` (answer
/// text), then `done` (request metrics) or `error`.
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    if req.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Message is required".to_string()));
    }

    // Cache hits hold the permit only briefly; misses hold it for the whole generation
    let permit = state
        .chat_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Chat service at capacity".to_string(),
            )
        })?;

    let answer = state
        .pipeline
        .answer(ChatQuery {
            question: req.message,
            requester: req.requester,
            history: req.history,
        })
        .await
        .map_err(pipeline_error)?;

    // Hold the semaphore permit for the lifetime of the stream
    let events = answer.map(move |event| {
        let _permit = &permit;
        Ok(to_sse(&event))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &ChatEvent) -> Event {
    let (name, payload) = event_payload(event);
    Event::default().event(name).data(payload.to_string())
}

fn event_payload(event: &ChatEvent) -> (&'static str, serde_json::Value) {
    match event {
        ChatEvent::Context {
            sources,
            cache_hit,
            degraded,
        } => (
            "context",
            json!({ "sources": sources, "cache_hit": cache_hit, "degraded": degraded }),
        ),
        ChatEvent::Delta(content) => ("delta", json!({ "content": content })),
        ChatEvent::Done(metrics) => ("done", json!({ "metrics": metrics })),
        ChatEvent::Error(message) => ("error", json!({ "message": message })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{build_metrics, MetricsContext, PerformanceTimings};
    use crate::models::{Citation, Degradation};

    #[test]
    fn test_context_payload() {
        let event = ChatEvent::Context {
            sources: vec![Citation {
                chunk_id: "c1".into(),
                document_id: "d1".into(),
                document_title: "Handbook".into(),
                source_tag: "upload".into(),
                score: 0.9,
            }],
            cache_hit: true,
            degraded: Some(Degradation::Semantic("embed timeout".into())),
        };
        let (name, payload) = event_payload(&event);
        assert_eq!(name, "context");
        assert_eq!(payload["cache_hit"], true);
        assert_eq!(payload["sources"][0]["document_title"], "Handbook");
        assert_eq!(payload["degraded"]["unavailable"], "semantic");
    }

    #[test]
    fn test_delta_and_error_payloads() {
        let (name, payload) = event_payload(&ChatEvent::Delta("Amen".into()));
        assert_eq!(name, "delta");
        assert_eq!(payload["content"], "Amen");

        let (name, payload) = event_payload(&ChatEvent::Error("stalled".into()));
        assert_eq!(name, "error");
        assert_eq!(payload["message"], "stalled");
    }

    #[test]
    fn test_done_payload_carries_metrics() {
        let metrics = build_metrics(&PerformanceTimings::new(), &MetricsContext::default());
        let (name, payload) = event_payload(&ChatEvent::Done(metrics));
        assert_eq!(name, "done");
        assert_eq!(payload["metrics"]["cache_hit"], false);
        assert!(payload["metrics"]["stages_ms"]["search"].is_number());
    }
}
