//! Core types used throughout the sharding layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shard identifier in the cluster (e.g. `shard_001`).
pub type ShardId = String;

/// Position on the hash ring.
pub type Token = u64;

/// A half-open token range `[start, end)`.
///
/// A range that ends at `u64::MAX` also covers `u64::MAX`, so the last
/// token of the ring always belongs to some range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: Token,
    pub end: Token,
}

impl TokenRange {
    /// Create a new range. `start` must be below `end`.
    pub fn new(start: Token, end: Token) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// The whole token space, `u64::MAX` included.
    pub fn full() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
        }
    }

    /// Check whether a token falls inside the range.
    pub fn contains(&self, token: Token) -> bool {
        token >= self.start && (token < self.end || self.end == Token::MAX)
    }

    /// Width of the range.
    pub fn width(&self) -> u64 {
        self.end - self.start
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
