//! Cache key normalization.
//!
//! A key is `<requester>:<question-hash>:<sorted-source-tags>[:<YYYY-MM>]`.
//! Logically identical queries over the same source state collide; case,
//! whitespace, tag order and sub-month sync drift do not change the key.

use chrono::{DateTime, Datelike, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::error::NormalizationError;

/// Everything that determines whether a cached answer is reusable.
#[derive(Debug, Clone)]
pub struct CacheKeyInput<'a> {
    pub question: &'a str,
    pub requester: &'a str,
    pub source_tags: &'a BTreeSet<String>,
    /// Latest sync time among the active external sources, if any.
    pub freshness: Option<DateTime<Utc>>,
}

pub fn build_cache_key(input: &CacheKeyInput<'_>) -> Result<String, NormalizationError> {
    let question = normalize_question(input.question);
    if question.is_empty() {
        return Err(NormalizationError::EmptyQuestion);
    }
    let requester = input.requester.trim();
    if requester.is_empty() {
        return Err(NormalizationError::EmptyRequester);
    }

    // Trim before deduplicating so " upload" and "upload" are one tag
    let tags = input
        .source_tags
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(escape_segment)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(",");

    let mut key = format!(
        "{}:{}:{}",
        escape_segment(requester),
        question_hash(&question),
        tags
    );
    if let Some(stamp) = input.freshness {
        key.push(':');
        key.push_str(&coarse_month(stamp));
    }
    Ok(key)
}

/// Lowercase and collapse runs of whitespace.
pub fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn question_hash(normalized: &str) -> String {
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

/// Truncate to the first of the month.
fn coarse_month(stamp: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", stamp.year(), stamp.month())
}

fn escape_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            ',' => out.push_str("%2C"),
            _ => out.push(c),
        }
    }
    out
}
