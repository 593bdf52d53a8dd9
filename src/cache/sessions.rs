use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;

use crate::models::Chunk;

/// Source state of one retrieval: which kinds of sources answered it and
/// how fresh the newest external data was.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceState {
    pub tags: BTreeSet<String>,
    pub freshness: Option<DateTime<Utc>>,
}

impl SourceState {
    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> Self {
        let mut state = Self::default();
        for chunk in chunks {
            state.tags.insert(chunk.source.source_tag());
            if let Some(synced) = chunk.source.freshness() {
                state.freshness = Some(state.freshness.map_or(synced, |f| f.max(synced)));
            }
        }
        state
    }
}

/// Remembers, per requester, the source state of their last retrieval.
/// Cache lookups are keyed on it because the current request's sources are
/// not known until search has run.
pub struct SessionSources {
    states: Mutex<LruCache<String, SourceState>>,
}

impl SessionSources {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            states: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Unknown requesters get the empty state.
    pub fn last(&self, requester: &str) -> SourceState {
        self.states.lock().get(requester).cloned().unwrap_or_default()
    }

    pub fn record(&self, requester: &str, state: SourceState) {
        self.states.lock().put(requester.to_string(), state);
    }
}
