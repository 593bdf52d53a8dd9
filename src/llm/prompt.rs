//! Prompt assembly for grounded answers.
//!
//! Everything that reaches the model from outside (question, history,
//! retrieved chunk text) goes through [`sanitize_for_prompt`] first.

use std::fmt::Write;

use crate::models::{ChatMessage, ChunkSource, RankedChunk};

pub const MAX_CHAT_MESSAGE_LEN: usize = 2000;
pub const MAX_HISTORY_TURNS: usize = 10;

/// Chat-template control tokens that must never appear in user-supplied text.
const CONTROL_TOKENS: &[&str] = &[
    "<|im_start|>",
    "<|im_end|>",
    "<|endoftext|>",
    "<|system|>",
    "<|user|>",
    "<|assistant|>",
];

/// Strip chat-template control tokens so retrieved or user text cannot
/// open a new turn in the prompt.
pub fn sanitize_for_prompt(text: &str) -> String {
    let mut out = text.to_string();
    for token in CONTROL_TOKENS {
        if out.contains(token) {
            out = out.replace(token, "");
        }
    }
    out
}

/// Keep user/assistant turns only, sanitized, newest `MAX_HISTORY_TURNS`.
pub fn validate_and_sanitize_history(history: Option<Vec<ChatMessage>>) -> Vec<ChatMessage> {
    let turns: Vec<ChatMessage> = history
        .unwrap_or_default()
        .into_iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .map(|m| ChatMessage {
            role: m.role,
            content: sanitize_for_prompt(&truncate_to_char_boundary(
                &m.content,
                MAX_CHAT_MESSAGE_LEN,
            )),
        })
        .collect();

    let skip = turns.len().saturating_sub(MAX_HISTORY_TURNS);
    turns.into_iter().skip(skip).collect()
}

pub fn build_system_prompt() -> String {
    String::from(
        "You are a ministry knowledge assistant.\n\
         Each user message includes passages retrieved from the organization's documents.\n\
         Answer ONLY from the provided passages. Never use outside knowledge.\n\
         If the passages don't answer the question, say what you found and what's missing.\n\
         Cite document titles when you use them.",
    )
}

pub fn build_context_block(chunks: &[RankedChunk]) -> String {
    let mut ctx = String::from("Here are passages from the organization's documents:\n\n");

    if chunks.is_empty() {
        ctx.push_str("(No relevant documents were found for this query.)\n");
        return ctx;
    }

    for ranked in chunks {
        let chunk = &ranked.chunk;
        let _ = writeln!(
            ctx,
            "--- {} [{}] ---",
            sanitize_for_prompt(&chunk.document_title),
            chunk.source.source_tag()
        );
        if let ChunkSource::External { facts, .. } = &chunk.source {
            for (name, value) in facts {
                let _ = writeln!(ctx, "{name}: {}", sanitize_for_prompt(value));
            }
        }
        let _ = write!(ctx, "{}\n\n", sanitize_for_prompt(&chunk.content));
    }

    ctx
}

pub fn build_messages(
    system_prompt: String,
    history: &[ChatMessage],
    context_block: &str,
    message: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage {
        role: "system".to_string(),
        content: system_prompt,
    });
    messages.extend(history.iter().cloned());
    // Context goes in the user turn so smaller models attend to it
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: format!("{context_block}---\nQuestion: {message}"),
    });
    messages
}

pub fn truncate_to_char_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    s.char_indices()
        .take_while(|(i, c)| i + c.len_utf8() <= max_len)
        .map(|(_, c)| c)
        .collect()
}
