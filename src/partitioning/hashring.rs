//! Consistent hashing implementation with virtual nodes.
//!
//! Each shard is represented by several virtual nodes (tokens) so that keys
//! spread evenly even with a small number of shards. Token `i` of shard `s`
//! sits at `xxh64("{s}#{i}")`; a key is owned by the first token at or after
//! its hash, wrapping around to the smallest token.

use crate::partitioning::urn::Urn;
use crate::types::{ShardId, Token};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hasher;
use tracing::{debug, warn};
use twox_hash::XxHash64;

/// Hash a string onto the ring.
pub fn hash_string(key: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key.as_bytes());
    hasher.finish()
}

fn token_for(shard_id: &str, index: usize) -> Token {
    hash_string(&format!("{}#{}", shard_id, index))
}

#[derive(Debug, Default)]
struct RingState {
    /// Token position to owning shard.
    ring: BTreeMap<Token, ShardId>,

    /// Tokens each shard inserted, so removal touches nothing else.
    shard_tokens: HashMap<ShardId, Vec<Token>>,
}

impl RingState {
    fn remove_tokens(&mut self, shard_id: &str) -> bool {
        match self.shard_tokens.remove(shard_id) {
            Some(tokens) => {
                for token in tokens {
                    self.ring.remove(&token);
                }
                true
            }
            None => false,
        }
    }

    fn owner_at(&self, hash: u64) -> Option<&ShardId> {
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, shard)| shard)
    }
}

/// A consistent hash ring mapping tokens to shards.
///
/// All methods take `&self`; a single internal lock guards the ring so it can
/// be shared behind an `Arc` by the resolver, router and rebalancer.
#[derive(Debug, Default)]
pub struct ConsistentHashRing {
    state: RwLock<RingState>,
}

impl ConsistentHashRing {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shard with `virtual_nodes` tokens.
    ///
    /// Re-adding a shard replaces its previous tokens.
    pub fn add_shard(&self, shard_id: &str, virtual_nodes: usize) {
        let mut state = self.state.write();
        if state.remove_tokens(shard_id) {
            debug!(shard_id, "Replacing existing ring tokens");
        }

        let mut tokens = Vec::with_capacity(virtual_nodes);
        for i in 0..virtual_nodes {
            let token = token_for(shard_id, i);
            match state.ring.get(&token) {
                Some(owner) if owner != shard_id => {
                    warn!(shard_id, token, owner = %owner, "Token collision, skipping virtual node");
                    continue;
                }
                Some(_) => continue,
                None => {
                    state.ring.insert(token, shard_id.to_string());
                    tokens.push(token);
                }
            }
        }

        debug!(shard_id, virtual_nodes = tokens.len(), "Added shard to ring");
        state.shard_tokens.insert(shard_id.to_string(), tokens);
    }

    /// Remove a shard and exactly the tokens it added.
    ///
    /// Returns `false` if the shard was not in the ring.
    pub fn remove_shard(&self, shard_id: &str) -> bool {
        let removed = self.state.write().remove_tokens(shard_id);
        if removed {
            debug!(shard_id, "Removed shard from ring");
        }
        removed
    }

    /// Shard owning the first token at or after `hash`.
    ///
    /// Returns `None` if the ring is empty.
    pub fn get_shard_for_hash(&self, hash: u64) -> Option<ShardId> {
        self.state.read().owner_at(hash).cloned()
    }

    /// Shard owning a resource name.
    pub fn get_shard_for_urn(&self, urn: &Urn) -> Option<ShardId> {
        self.get_shard_for_hash(urn.hash())
    }

    /// Up to `count` distinct shards walking clockwise from `hash`.
    ///
    /// The first element is the owner of `hash`.
    pub fn get_successors(&self, hash: u64, count: usize) -> Vec<ShardId> {
        let state = self.state.read();
        if count == 0 || state.ring.is_empty() {
            return Vec::new();
        }

        let mut result = Vec::with_capacity(count.min(state.shard_tokens.len()));
        let mut seen = HashSet::new();

        // One full revolution at most.
        for (_, shard) in state.ring.range(hash..).chain(state.ring.range(..hash)) {
            if seen.insert(shard.as_str()) {
                result.push(shard.clone());
                if result.len() >= count {
                    break;
                }
            }
        }

        result
    }

    /// Minimum and maximum token of a shard.
    ///
    /// A shard owns one arc per virtual node; this is the overall span only.
    pub fn get_shard_range(&self, shard_id: &str) -> Option<(Token, Token)> {
        let state = self.state.read();
        let tokens = state.shard_tokens.get(shard_id)?;
        let min = tokens.iter().min()?;
        let max = tokens.iter().max()?;
        Some((*min, *max))
    }

    /// All shards in the ring, sorted.
    pub fn get_all_shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<_> = self.state.read().shard_tokens.keys().cloned().collect();
        shards.sort();
        shards
    }

    /// Coefficient of variation of virtual node counts, as a percentage.
    pub fn get_balance_factor(&self) -> f64 {
        let state = self.state.read();
        if state.shard_tokens.is_empty() {
            return 0.0;
        }

        let n = state.shard_tokens.len() as f64;
        let mean = state.ring.len() as f64 / n;
        if mean == 0.0 {
            return 0.0;
        }

        let variance = state
            .shard_tokens
            .values()
            .map(|tokens| {
                let diff = tokens.len() as f64 - mean;
                diff * diff
            })
            .sum::<f64>()
            / n;

        variance.sqrt() / mean * 100.0
    }

    /// Total number of tokens in the ring.
    pub fn get_virtual_node_count(&self) -> usize {
        self.state.read().ring.len()
    }

    /// Tokens owned by one shard.
    pub fn get_shard_virtual_nodes(&self, shard_id: &str) -> usize {
        self.state
            .read()
            .shard_tokens
            .get(shard_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of shards.
    pub fn size(&self) -> usize {
        self.state.read().shard_tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().ring.is_empty()
    }

    pub fn contains_shard(&self, shard_id: &str) -> bool {
        self.state.read().shard_tokens.contains_key(shard_id)
    }

    /// Remove every shard.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.ring.clear();
        state.shard_tokens.clear();
    }

    /// Arcs that would move to `new_shard` if it joined with `virtual_nodes`
    /// tokens, grouped by current owner.
    ///
    /// Each returned range is `(previous_token, new_token]` expressed as the
    /// half-open `[previous_token + 1, new_token + 1)`; arcs wrapping past
    /// zero are split in two.
    pub fn preview_add_shard(&self, new_shard: &str, virtual_nodes: usize) -> Vec<OwnershipChange> {
        let state = self.state.read();
        if state.ring.is_empty() || state.shard_tokens.contains_key(new_shard) {
            return Vec::new();
        }

        let new_tokens: Vec<Token> = (0..virtual_nodes)
            .map(|i| token_for(new_shard, i))
            .filter(|t| !state.ring.contains_key(t))
            .collect();
        let new_set: HashSet<Token> = new_tokens.iter().copied().collect();

        let mut changes = Vec::new();
        for &token in &new_tokens {
            let Some(from) = state.owner_at(token) else {
                continue;
            };

            // Start of the arc: the nearest preceding token in the merged ring.
            let prev_existing = state
                .ring
                .range(..token)
                .next_back()
                .map(|(t, _)| *t)
                .or_else(|| state.ring.keys().next_back().copied());
            let prev_new = new_set
                .iter()
                .copied()
                .filter(|t| *t < token)
                .max()
                .or_else(|| new_set.iter().copied().filter(|t| *t > token).max());
            let prev = match (prev_existing, prev_new) {
                (Some(a), Some(b)) => Some(closest_before(token, a, b)),
                (a, b) => a.or(b),
            };
            let Some(prev) = prev else { continue };

            for (start, end) in arc_ranges(prev, token) {
                changes.push(OwnershipChange {
                    from_shard: from.clone(),
                    to_shard: new_shard.to_string(),
                    start,
                    end,
                });
            }
        }

        changes.sort_by_key(|c| c.start);
        changes
    }
}

/// Of two candidate predecessors, the one closest before `token` going
/// counter-clockwise.
fn closest_before(token: Token, a: Token, b: Token) -> Token {
    let dist = |p: Token| token.wrapping_sub(p);
    if dist(a) <= dist(b) {
        a
    } else {
        b
    }
}

/// Ranges covering the arc `(prev, token]`, with the same reading of an
/// end at `u64::MAX` as [`TokenRange`](crate::types::TokenRange).
fn arc_ranges(prev: Token, token: Token) -> Vec<(u64, u64)> {
    if prev < token {
        vec![(prev + 1, token.saturating_add(1))]
    } else {
        let mut ranges = Vec::with_capacity(2);
        if prev < u64::MAX {
            ranges.push((prev + 1, u64::MAX));
        }
        ranges.push((0, token.saturating_add(1)));
        ranges
    }
}

/// A token arc that changes owner when a shard joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipChange {
    /// Shard losing the arc.
    pub from_shard: ShardId,

    /// Shard gaining the arc.
    pub to_shard: ShardId,

    /// Inclusive start token.
    pub start: Token,

    /// Exclusive end token; an end of `u64::MAX` includes `u64::MAX`.
    pub end: Token,
}
