use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct DedupState {
    expiries: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

/// Remembers which resource occurrences were already dispatched.
///
/// Entries expire after `ttl` and the cache never holds more than `max_entries`;
/// when full, the oldest entry is evicted first.
#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    max_entries: usize,
    state: Mutex<DedupState>,
}

impl DedupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            state: Mutex::new(DedupState {
                expiries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Records `resource_id` and returns `true` if it was not already live.
    pub async fn check_and_insert(&self, resource_id: &str) -> bool {
        self.check_and_insert_at(resource_id, Instant::now()).await
    }

    async fn check_and_insert_at(&self, resource_id: &str, now: Instant) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let purged = purge_expired(state, now);
        if purged > 0 {
            debug!(count = purged, "Purged expired dedup entries");
        }

        if state.expiries.contains_key(resource_id) {
            return false;
        }

        while state.expiries.len() >= self.max_entries {
            let Some((oldest, _)) = state.order.pop_front() else {
                break;
            };
            state.expiries.remove(&oldest);
            debug!(resource_id = %oldest, "Evicted dedup entry at capacity");
        }

        let expires_at = now + self.ttl;
        state.expiries.insert(resource_id.to_string(), expires_at);
        state.order.push_back((resource_id.to_string(), expires_at));
        true
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.expiries.len()
    }
}

// Insertion order equals expiry order because the TTL is fixed.
fn purge_expired(state: &mut DedupState, now: Instant) -> usize {
    let mut purged = 0;
    while let Some((_, expires_at)) = state.order.front() {
        if *expires_at > now {
            break;
        }
        if let Some((key, _)) = state.order.pop_front() {
            state.expiries.remove(&key);
            purged += 1;
        }
    }
    purged
}
