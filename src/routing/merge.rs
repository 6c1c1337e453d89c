//! Merging and paging of multi-shard results.

use crate::error::ShardError;
use crate::types::ShardId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one shard's part in a fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardResult {
    pub shard_id: ShardId,
    pub outcome: Result<Value, ShardError>,
    pub execution_time_ms: u64,
}

impl ShardResult {
    pub fn success(shard_id: impl Into<ShardId>, data: Value, execution_time_ms: u64) -> Self {
        Self {
            shard_id: shard_id.into(),
            outcome: Ok(data),
            execution_time_ms,
        }
    }

    pub fn failure(error: ShardError, execution_time_ms: u64) -> Self {
        Self {
            shard_id: error.shard_id.clone(),
            outcome: Err(error),
            execution_time_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Union of shard results with per-shard errors kept apart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    pub results: Vec<Value>,
    pub errors: Vec<ShardError>,
    pub shard_count: usize,
    pub success_count: usize,
    pub error_count: usize,

    /// Set by [`apply_pagination`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Number of results before paging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
}

impl MergedResult {
    /// Every contacted shard failed.
    pub fn is_total_failure(&self) -> bool {
        self.shard_count > 0 && self.success_count == 0
    }

    /// Some, but not all, shards failed.
    pub fn is_partial_failure(&self) -> bool {
        self.error_count > 0 && self.success_count > 0
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Concatenate shard results in input order.
///
/// A shard answering with an array, or with an object holding a `results`
/// array, contributes its elements; any other value is one result.
pub fn merge_results(results: &[ShardResult]) -> MergedResult {
    let mut merged = MergedResult {
        shard_count: results.len(),
        ..Default::default()
    };

    for result in results {
        match &result.outcome {
            Ok(Value::Array(items)) => {
                merged.success_count += 1;
                merged.results.extend(items.iter().cloned());
            }
            Ok(data) => {
                merged.success_count += 1;
                match data.get("results").and_then(Value::as_array) {
                    Some(items) => merged.results.extend(items.iter().cloned()),
                    None => merged.results.push(data.clone()),
                }
            }
            Err(error) => merged.errors.push(error.clone()),
        }
    }

    merged.error_count = merged.shard_count - merged.success_count;
    merged
}

/// Keep `limit` results starting at `offset`. Applied after the merge so
/// pages are taken over the union of all shards.
pub fn apply_pagination(mut merged: MergedResult, offset: usize, limit: usize) -> MergedResult {
    let total = merged.results.len();
    let start = offset.min(total);
    let end = start.saturating_add(limit).min(total);

    merged.results = merged.results.drain(start..end).collect();
    merged.offset = Some(offset);
    merged.limit = Some(limit);
    merged.total_count = Some(total);
    merged
}
