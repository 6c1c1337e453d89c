//! Bounded replay cache of recently seen request nonces.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

#[derive(Debug, Default)]
struct NonceState {
    /// Nonce to the time it was recorded.
    seen: HashMap<u64, u64>,

    /// Insertion order, oldest first.
    order: VecDeque<(u64, u64)>,
}

/// Thread-safe record of nonces accepted within the expiry window.
///
/// Pruning is opportunistic: it only runs when an insert pushes the cache
/// over its bound. Expired entries go first; if that is not enough, the
/// oldest half is evicted.
#[derive(Debug)]
pub struct NonceCache {
    state: Mutex<NonceState>,
    max_entries: usize,
    expiry_ms: u64,
}

impl NonceCache {
    pub fn new(max_entries: usize, expiry_ms: u64) -> Self {
        Self {
            state: Mutex::new(NonceState::default()),
            max_entries: max_entries.max(1),
            expiry_ms,
        }
    }

    /// Whether `nonce` was recorded and has not been pruned.
    pub fn contains(&self, nonce: u64) -> bool {
        self.state.lock().seen.contains_key(&nonce)
    }

    /// Record `nonce`. Returns `false` if it was already present.
    pub fn insert(&self, nonce: u64, now_ms: u64) -> bool {
        let mut state = self.state.lock();
        if state.seen.contains_key(&nonce) {
            return false;
        }
        state.seen.insert(nonce, now_ms);
        state.order.push_back((nonce, now_ms));

        if state.seen.len() > self.max_entries {
            self.prune_locked(&mut state, now_ms);
        }
        true
    }

    /// Drop expired entries, then the oldest half if still over the bound.
    pub fn prune(&self, now_ms: u64) -> usize {
        let mut state = self.state.lock();
        self.prune_locked(&mut state, now_ms)
    }

    fn prune_locked(&self, state: &mut NonceState, now_ms: u64) -> usize {
        let before = state.seen.len();
        let cutoff = now_ms.saturating_sub(self.expiry_ms);

        while let Some(&(nonce, seen_at)) = state.order.front() {
            if seen_at >= cutoff {
                break;
            }
            state.order.pop_front();
            state.seen.remove(&nonce);
        }

        if state.seen.len() > self.max_entries {
            let evict = state.seen.len() / 2;
            for _ in 0..evict {
                if let Some((nonce, _)) = state.order.pop_front() {
                    state.seen.remove(&nonce);
                }
            }
        }

        let removed = before - state.seen.len();
        if removed > 0 {
            debug!(removed, remaining = state.seen.len(), "Pruned nonce cache");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().seen.is_empty()
    }
}
