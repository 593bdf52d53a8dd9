use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-key markers for generations that are currently running.
///
/// The first miss on a key takes the marker; later misses wait for it to
/// be released (the first generation finished or was abandoned) and then
/// re-check the cache before generating themselves.
#[derive(Default)]
pub struct InflightRegistry {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the lifetime of one generation.
pub struct InflightGuard {
    registry: Arc<InflightRegistry>,
    key: String,
    slot: Arc<AsyncMutex<()>>,
    _held: Option<OwnedMutexGuard<()>>,
}

/// How the caller came to hold the marker.
pub enum Acquired {
    /// Nobody else was generating this key.
    Free(InflightGuard),
    /// Another generation for this key finished (or gave up) first.
    AfterWait(InflightGuard),
    /// The wait bound elapsed; proceed without the marker.
    TimedOut,
}

impl InflightRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn acquire(self: &Arc<Self>, key: &str, max_wait: Duration) -> Acquired {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        if let Ok(held) = slot.clone().try_lock_owned() {
            return Acquired::Free(self.guard(key, slot, held));
        }

        match tokio::time::timeout(max_wait, slot.clone().lock_owned()).await {
            Ok(held) => Acquired::AfterWait(self.guard(key, slot, held)),
            Err(_) => {
                self.release_if_idle(key, &slot, 1);
                Acquired::TimedOut
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots.lock().len()
    }

    fn guard(
        self: &Arc<Self>,
        key: &str,
        slot: Arc<AsyncMutex<()>>,
        held: OwnedMutexGuard<()>,
    ) -> InflightGuard {
        InflightGuard {
            registry: Arc::clone(self),
            key: key.to_string(),
            slot,
            _held: Some(held),
        }
    }

    /// Drop the map entry once no task other than the caller references it.
    /// `own_refs` counts the caller's handles to the slot.
    fn release_if_idle(&self, key: &str, slot: &Arc<AsyncMutex<()>>, own_refs: usize) {
        let mut slots = self.slots.lock();
        if let Some(current) = slots.get(key) {
            // one reference held by the map itself
            if Arc::ptr_eq(current, slot) && Arc::strong_count(slot) <= own_refs + 1 {
                slots.remove(key);
            }
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        // Our `slot` field plus the Arc inside the owned lock guard
        self.registry.release_if_idle(&self.key, &self.slot, 2);
        self._held.take();
    }
}
