//! Query classification.

use crate::partitioning::Urn;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static URN_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"urn:themis:[^:\s]+:[^:\s]+:[^:\s]+:[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}").ok()
});

static NAMESPACE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"NAMESPACE\s+([A-Za-z0-9_]+)").ok());

/// How a request is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Exactly one owning shard.
    SingleShard,
    /// Every healthy shard.
    ScatterGather,
    /// Shards holding one namespace. Without a namespace index this fans
    /// out like [`ScatterGather`](Self::ScatterGather).
    NamespaceLocal,
    /// Two collections that may live apart: scatter, then merge on the caller.
    CrossShardJoin,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::SingleShard => "single_shard",
            RoutingStrategy::ScatterGather => "scatter_gather",
            RoutingStrategy::NamespaceLocal => "namespace_local",
            RoutingStrategy::CrossShardJoin => "cross_shard_join",
        }
    }

    /// Whether the strategy contacts more than one shard.
    pub fn is_fan_out(&self) -> bool {
        !matches!(self, RoutingStrategy::SingleShard)
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick a strategy for a query string.
///
/// An embedded identifier wins, then a join, then a namespace scope;
/// anything else is a full scan.
pub fn analyze_query(query: &str) -> RoutingStrategy {
    if query.contains("urn:themis:") {
        RoutingStrategy::SingleShard
    } else if contains_word_ci(query, "join") {
        RoutingStrategy::CrossShardJoin
    } else if query.contains("NAMESPACE") {
        RoutingStrategy::NamespaceLocal
    } else {
        RoutingStrategy::ScatterGather
    }
}

fn contains_word_ci(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|token| token.eq_ignore_ascii_case(word))
}

/// First well-formed identifier in `query`.
pub fn extract_urn(query: &str) -> Option<Urn> {
    URN_PATTERN
        .as_ref()?
        .find_iter(query)
        .find_map(|m| Urn::parse(m.as_str()).ok())
}

/// Namespace named by a `NAMESPACE <name>` clause.
pub fn extract_namespace(query: &str) -> Option<String> {
    NAMESPACE_PATTERN
        .as_ref()?
        .captures(query)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
