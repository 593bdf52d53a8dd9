use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::models::ChatMessage;

/// One item of a generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Incremental answer text.
    Delta(String),
    /// Token accounting, usually sent once near the end.
    Usage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Streaming text generation.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Start a generation. The returned stream ends when the model is done.
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<ChatStream>;

    fn model_name(&self) -> String;
}

/// Generation against the configured Ollama / OpenAI-compatible endpoint.
pub struct HttpChatProvider {
    client: reqwest::Client,
    config: Arc<RwLock<LlmConfig>>,
}

impl HttpChatProvider {
    pub fn new(client: reqwest::Client, config: Arc<RwLock<LlmConfig>>) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ChatProvider for HttpChatProvider {
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<ChatStream> {
        let config = self.config.read().clone();
        stream_chat(&self.client, &config, messages).await
    }

    fn model_name(&self) -> String {
        self.config.read().chat_model.clone()
    }
}

/// Stream chat completions from Ollama or OpenAI.
pub async fn stream_chat(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
) -> Result<ChatStream> {
    match config.provider.as_str() {
        "ollama" => stream_ollama(client, config, messages).await,
        "openai" => stream_openai(client, config, messages).await,
        other => anyhow::bail!("Unsupported LLM provider for chat: {other}"),
    }
}

#[derive(Serialize, Deserialize)]
struct StreamMessage {
    role: String,
    content: String,
}

fn to_stream_messages(messages: Vec<ChatMessage>) -> Vec<StreamMessage> {
    messages
        .into_iter()
        .map(|m| StreamMessage {
            role: m.role,
            content: m.content,
        })
        .collect()
}

// ─── Ollama streaming ────────────────────────────────────

#[derive(Serialize)]
struct OllamaStreamRequest {
    model: String,
    messages: Vec<StreamMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaStreamChunk {
    message: Option<StreamMessage>,
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

async fn stream_ollama(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
) -> Result<ChatStream> {
    let url = format!("{}/api/chat", config.base_url);

    let req = OllamaStreamRequest {
        model: config.chat_model.clone(),
        messages: to_stream_messages(messages),
        stream: true,
    };

    let resp = client
        .post(&url)
        .timeout(Duration::from_secs(300))
        .json(&req)
        .send()
        .await
        .context("Failed to connect to Ollama for chat streaming")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Ollama chat API returned {status}: {body}");
    }

    let stream = stream_lines(resp.bytes_stream()).filter_map(|line_result| async move {
        match line_result {
            Ok(line) => parse_ollama_line(&line),
            Err(e) => Some(Err(e)),
        }
    });

    Ok(Box::pin(stream))
}

/// Parse a single Ollama streaming line. Returns:
/// - Some(Ok(Delta)) for content
/// - Some(Ok(Usage)) for the final `done` line when it carries counts
/// - Some(Err(e)) for parse errors
/// - None to skip
fn parse_ollama_line(line: &str) -> Option<Result<StreamChunk>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match serde_json::from_str::<OllamaStreamChunk>(line) {
        Ok(chunk) => {
            if chunk.done {
                return match (chunk.prompt_eval_count, chunk.eval_count) {
                    (None, None) => None,
                    (p, c) => Some(Ok(StreamChunk::Usage {
                        prompt_tokens: p.unwrap_or(0),
                        completion_tokens: c.unwrap_or(0),
                    })),
                };
            }
            let content = chunk.message.map(|m| m.content).unwrap_or_default();
            if content.is_empty() {
                return None;
            }
            Some(Ok(StreamChunk::Delta(content)))
        }
        Err(e) => Some(Err(anyhow::anyhow!("Failed to parse Ollama chunk: {e}"))),
    }
}

// ─── OpenAI streaming ────────────────────────────────────

#[derive(Serialize)]
struct OpenAiStreamRequest {
    model: String,
    messages: Vec<StreamMessage>,
    stream: bool,
    stream_options: OpenAiStreamOptions,
}

#[derive(Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

async fn stream_openai(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: Vec<ChatMessage>,
) -> Result<ChatStream> {
    let url = format!("{}/v1/chat/completions", config.base_url);

    let req = OpenAiStreamRequest {
        model: config.chat_model.clone(),
        messages: to_stream_messages(messages),
        stream: true,
        stream_options: OpenAiStreamOptions {
            include_usage: true,
        },
    };

    let resp = client
        .post(&url)
        .timeout(Duration::from_secs(300))
        .header(
            "Authorization",
            format!("Bearer {}", config.api_key.as_deref().unwrap_or("")),
        )
        .json(&req)
        .send()
        .await
        .context("Failed to connect to OpenAI for chat streaming")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("OpenAI chat API returned {status}: {body}");
    }

    let stream = stream_lines(resp.bytes_stream()).filter_map(|line_result| async move {
        match line_result {
            Ok(line) => parse_openai_line(&line),
            Err(e) => Some(Err(e)),
        }
    });

    Ok(Box::pin(stream))
}

/// Parse a single OpenAI SSE line. Returns:
/// - Some(Ok(Delta)) for content
/// - Some(Ok(Usage)) for the trailing usage chunk
/// - Some(Err(e)) for parse errors
/// - None to skip (empty lines, [DONE], role-only chunks)
fn parse_openai_line(line: &str) -> Option<Result<StreamChunk>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let data = line.strip_prefix("data: ")?.trim();
    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(chunk) => {
            if let Some(usage) = chunk.usage {
                return Some(Ok(StreamChunk::Usage {
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                }));
            }
            let content = chunk
                .choices
                .first()
                .and_then(|c| c.delta.content.clone())
                .unwrap_or_default();
            if content.is_empty() {
                return None;
            }
            Some(Ok(StreamChunk::Delta(content)))
        }
        Err(e) => Some(Err(anyhow::anyhow!("Failed to parse OpenAI chunk: {e}"))),
    }
}

// ─── Line buffering ──────────────────────────────────────

/// Convert a byte stream into a stream of complete lines.
///
/// Bytes are buffered until a newline arrives, so a multi-byte character
/// split across network chunks is decoded whole.
fn stream_lines(
    byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<String>> + Send {
    futures_util::stream::unfold(
        (Box::pin(byte_stream), Vec::<u8>::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                // First, try to extract a complete line from the buffer
                if let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = buffer.drain(..=newline_pos).collect();
                    match decode_line(&raw[..newline_pos]) {
                        Ok(line) if line.trim().is_empty() => continue,
                        result => return Some((result, (stream, buffer))),
                    }
                }

                match stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.extend_from_slice(&bytes);
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(anyhow::anyhow!("Stream read error: {e}")),
                            (stream, buffer),
                        ));
                    }
                    None => {
                        // Stream ended: emit remaining buffer if non-empty
                        let remaining = std::mem::take(&mut buffer);
                        return match decode_line(&remaining) {
                            Ok(line) if line.trim().is_empty() => None,
                            result => Some((result, (stream, buffer))),
                        };
                    }
                }
            }
        },
    )
}

fn decode_line(raw: &[u8]) -> Result<String> {
    String::from_utf8(raw.to_vec()).context("LLM stream line is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Ollama parsing ──────────────────────────────────

    #[test]
    fn test_parse_ollama_chunk() {
        let line = r#"{"message":{"role":"assistant","content":"The main"},"done":false}"#;
        let result = parse_ollama_line(line);
        assert_eq!(result.unwrap().unwrap(), StreamChunk::Delta("The main".into()));
    }

    #[test]
    fn test_parse_ollama_done_with_counts() {
        let line = r#"{"message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":412,"eval_count":96}"#;
        let result = parse_ollama_line(line);
        assert_eq!(
            result.unwrap().unwrap(),
            StreamChunk::Usage {
                prompt_tokens: 412,
                completion_tokens: 96
            }
        );
    }

    #[test]
    fn test_parse_ollama_done_without_counts() {
        let line = r#"{"message":{"role":"assistant","content":""},"done":true}"#;
        assert!(parse_ollama_line(line).is_none());
    }

    #[test]
    fn test_parse_ollama_empty_content() {
        let line = r#"{"message":{"role":"assistant","content":""},"done":false}"#;
        assert!(parse_ollama_line(line).is_none());
    }

    #[test]
    fn test_parse_ollama_malformed() {
        let result = parse_ollama_line("not valid json{{{");
        assert!(result.unwrap().is_err());
    }

    // ─── OpenAI parsing ──────────────────────────────────

    #[test]
    fn test_parse_openai_data_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        let result = parse_openai_line(line);
        assert_eq!(result.unwrap().unwrap(), StreamChunk::Delta("Hello".into()));
    }

    #[test]
    fn test_parse_openai_usage_chunk() {
        let line = r#"data: {"choices":[],"usage":{"prompt_tokens":50,"completion_tokens":7,"total_tokens":57}}"#;
        let result = parse_openai_line(line);
        assert_eq!(
            result.unwrap().unwrap(),
            StreamChunk::Usage {
                prompt_tokens: 50,
                completion_tokens: 7
            }
        );
    }

    #[test]
    fn test_parse_openai_done() {
        assert!(parse_openai_line("data: [DONE]").is_none());
    }

    #[test]
    fn test_parse_openai_empty_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":null}}]}"#;
        assert!(parse_openai_line(line).is_none());
    }

    #[test]
    fn test_parse_openai_role_only_chunk() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(parse_openai_line(line).is_none());
    }

    #[test]
    fn test_parse_openai_malformed() {
        let result = parse_openai_line("data: {broken json");
        assert!(result.unwrap().is_err());
    }

    // ─── Edge cases ──────────────────────────────────────

    #[test]
    fn test_parse_whitespace_line() {
        assert!(parse_ollama_line("   ").is_none());
        assert!(parse_openai_line("   ").is_none());
    }

    #[test]
    fn test_parse_openai_non_data_line() {
        assert!(parse_openai_line("event: message").is_none());
    }

    #[tokio::test]
    async fn test_stream_lines_joins_split_chunks() {
        let parts: Vec<reqwest::Result<bytes::Bytes>> = vec![
            Ok(bytes::Bytes::from_static(b"data: one\nda")),
            Ok(bytes::Bytes::from_static(b"ta: two\n\ntrailing")),
        ];
        let lines: Vec<String> = stream_lines(futures_util::stream::iter(parts))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["data: one", "data: two", "trailing"]);
    }

    #[tokio::test]
    async fn test_stream_lines_keeps_character_split_across_chunks() {
        let parts: Vec<reqwest::Result<bytes::Bytes>> = vec![
            Ok(bytes::Bytes::from_static(b"data: caf\xC3")),
            Ok(bytes::Bytes::from_static(b"\xA9\n")),
            Ok(bytes::Bytes::from_static(b"data: \xE2\x9C")),
            Ok(bytes::Bytes::from_static(b"\x9D")),
        ];
        let lines: Vec<String> = stream_lines(futures_util::stream::iter(parts))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["data: caf\u{e9}", "data: \u{271d}"]);
    }

    #[tokio::test]
    async fn test_stream_lines_rejects_invalid_utf8() {
        let parts: Vec<reqwest::Result<bytes::Bytes>> = vec![
            Ok(bytes::Bytes::from_static(b"data: \xFF\n")),
            Ok(bytes::Bytes::from_static(b"data: ok\n")),
        ];
        let lines: Vec<Result<String>> = stream_lines(futures_util::stream::iter(parts))
            .collect()
            .await;
        assert!(lines[0].is_err());
        assert_eq!(lines[1].as_ref().unwrap(), "data: ok");
    }
}
