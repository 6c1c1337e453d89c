//! Batch copy of a token range between shards.

use crate::error::{MigrationError, Result};
use crate::metrics::ShardingMetrics;
use crate::rebalancing::data::{MigrationRecord, ShardDataAccess};
use crate::types::{now_millis, TokenRange};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Migration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Records per fetch/write round.
    pub batch_size: usize,

    /// Hash source and target ranges after the copy and compare.
    pub verify_integrity: bool,

    /// Batch failures tolerated before the migration aborts.
    pub max_retries: u32,

    /// Base delay before retrying a batch; grows linearly with the error count.
    pub retry_delay_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            verify_integrity: true,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl MigrationConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_verify_integrity(mut self, verify: bool) -> Self {
        self.verify_integrity = verify;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay.as_millis() as u64;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub records_migrated: u64,
    pub total_records: u64,
    pub bytes_transferred: u64,
    pub errors: u32,
    pub progress_percent: f64,
    pub started_at_ms: u64,
    /// Extrapolated from elapsed time and percent complete.
    pub estimated_completion_ms: Option<u64>,
}

impl MigrationProgress {
    fn record_batch(&mut self, records: u64, bytes: u64) {
        self.records_migrated += records;
        self.bytes_transferred += bytes;
        if self.total_records == 0 {
            return;
        }
        self.progress_percent =
            (self.records_migrated as f64 / self.total_records as f64 * 100.0).min(100.0);
        if self.progress_percent > 0.0 {
            let elapsed = now_millis().saturating_sub(self.started_at_ms) as f64;
            let total = elapsed * 100.0 / self.progress_percent;
            self.estimated_completion_ms = Some(self.started_at_ms + total as u64);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub records_migrated: u64,
    pub bytes_transferred: u64,
    pub batches: u64,
    /// Batch failures that were retried.
    pub errors: Vec<String>,
    pub source_hash: Option<String>,
    pub target_hash: Option<String>,
    pub elapsed_ms: u64,
}

/// Copies records through a [`ShardDataAccess`].
///
/// Never touches the ring; cutover is the caller's job once this returns `Ok`.
pub struct DataMigrator {
    data: Arc<dyn ShardDataAccess>,
    config: MigrationConfig,
    metrics: Option<Arc<ShardingMetrics>>,
}

impl DataMigrator {
    pub fn new(data: Arc<dyn ShardDataAccess>, config: MigrationConfig) -> Self {
        Self {
            data,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ShardingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Copy every record of `source` in `range` to `target`.
    ///
    /// A failed batch is retried at the same offset until more than
    /// `max_retries` failures have accumulated. With integrity checking on,
    /// both ranges are rehashed at the end and must agree.
    pub async fn migrate<F>(
        &self,
        source: &str,
        target: &str,
        range: TokenRange,
        on_progress: F,
    ) -> Result<MigrationResult>
    where
        F: FnMut(&MigrationProgress) + Send,
    {
        let mut created = BTreeSet::new();
        self.migrate_tracked(source, target, range, &mut created, on_progress)
            .await
    }

    /// Like [`migrate`](Self::migrate), collecting into `created` every key
    /// the copy may have added to `target`.
    ///
    /// Keys the target already held in `range` before the copy are never
    /// collected, so purging `created` undoes the copy without touching the
    /// target's own records. `created` is filled even when the copy fails.
    pub async fn migrate_tracked<F>(
        &self,
        source: &str,
        target: &str,
        range: TokenRange,
        created: &mut BTreeSet<String>,
        mut on_progress: F,
    ) -> Result<MigrationResult>
    where
        F: FnMut(&MigrationProgress) + Send,
    {
        if self.config.batch_size == 0 {
            return Err(MigrationError::Invalid("batch size must be > 0".into()).into());
        }
        if source == target {
            return Err(MigrationError::Invalid(format!("source and target are both {}", source)).into());
        }

        let start = Instant::now();
        let total = self
            .data
            .count_range(source, range)
            .await
            .map_err(|e| MigrationError::FetchFailed {
                shard_id: source.to_string(),
                reason: e.to_string(),
            })?;
        let existing = self.range_keys(target, range).await?;
        info!(source, target, %range, total, existing = existing.len(), "Starting migration");

        let mut progress = MigrationProgress {
            total_records: total as u64,
            started_at_ms: now_millis(),
            ..Default::default()
        };
        let mut result = MigrationResult::default();
        let mut offset = 0usize;

        loop {
            let batch = match self
                .copy_batch(source, target, range, offset, &existing, created)
                .await
            {
                Ok(batch) => batch,
                Err(reason) => {
                    progress.errors += 1;
                    warn!(source, target, offset, errors = progress.errors, %reason, "Batch failed");
                    result.errors.push(format!("offset {}: {}", offset, reason));
                    if progress.errors > self.config.max_retries {
                        return Err(MigrationError::TooManyErrors {
                            errors: progress.errors,
                            last_error: reason,
                        }
                        .into());
                    }
                    let delay = self.config.retry_delay_ms * progress.errors as u64;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    continue;
                }
            };

            if batch.records == 0 {
                break;
            }

            result.batches += 1;
            progress.record_batch(batch.records as u64, batch.bytes);
            if let Some(metrics) = &self.metrics {
                metrics.record_migration_batch(batch.records as u64, batch.bytes);
                metrics.set_migration_progress(progress.progress_percent);
            }
            debug!(offset, records = batch.records, percent = progress.progress_percent, "Batch copied");
            on_progress(&progress);

            offset += batch.records;
            if batch.records < self.config.batch_size {
                break;
            }
        }

        result.records_migrated = progress.records_migrated;
        result.bytes_transferred = progress.bytes_transferred;

        if self.config.verify_integrity {
            let source_hash = self.range_hash(source, range).await?;
            let target_hash = self.range_hash(target, range).await?;
            if source_hash != target_hash {
                warn!(source, target, %range, %source_hash, %target_hash, "Integrity check failed");
                return Err(MigrationError::IntegrityMismatch {
                    source_hash,
                    target_hash,
                }
                .into());
            }
            result.source_hash = Some(source_hash);
            result.target_hash = Some(target_hash);
        }

        result.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            source,
            target,
            records = result.records_migrated,
            bytes = result.bytes_transferred,
            elapsed_ms = result.elapsed_ms,
            "Migration finished"
        );
        Ok(result)
    }

    async fn copy_batch(
        &self,
        source: &str,
        target: &str,
        range: TokenRange,
        offset: usize,
        existing: &HashSet<String>,
        created: &mut BTreeSet<String>,
    ) -> std::result::Result<BatchOutcome, String> {
        let records = self
            .data
            .fetch_batch(source, range, offset, self.config.batch_size)
            .await
            .map_err(|e| format!("fetch from {} failed: {}", source, e))?;
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }

        // A failed write may still have stored part of the batch.
        created.extend(
            records
                .iter()
                .filter(|record| !existing.contains(&record.key))
                .map(|record| record.key.clone()),
        );
        let written = self
            .data
            .write_batch(target, &records)
            .await
            .map_err(|e| format!("write to {} failed: {}", target, e))?;
        if written != records.len() {
            return Err(format!(
                "write to {} stored {} of {} records",
                target,
                written,
                records.len()
            ));
        }

        Ok(BatchOutcome {
            records: records.len(),
            bytes: records.iter().map(MigrationRecord::size_bytes).sum(),
        })
    }

    async fn range_keys(&self, shard: &str, range: TokenRange) -> Result<HashSet<String>> {
        let limit = self.config.batch_size.max(1);
        let mut keys = HashSet::new();
        let mut offset = 0;
        loop {
            let batch = self
                .data
                .fetch_batch(shard, range, offset, limit)
                .await
                .map_err(|e| MigrationError::FetchFailed {
                    shard_id: shard.to_string(),
                    reason: e.to_string(),
                })?;
            offset += batch.len();
            let done = batch.len() < limit;
            keys.extend(batch.into_iter().map(|record| record.key));
            if done {
                return Ok(keys);
            }
        }
    }

    /// SHA-256 over every record of `shard` in `range`, in `(token, key)` order.
    pub async fn range_hash(&self, shard: &str, range: TokenRange) -> Result<String> {
        let mut hasher = Sha256::new();
        let mut offset = 0;
        loop {
            let batch = self
                .data
                .fetch_batch(shard, range, offset, self.config.batch_size.max(1))
                .await
                .map_err(|e| MigrationError::FetchFailed {
                    shard_id: shard.to_string(),
                    reason: e.to_string(),
                })?;
            for record in &batch {
                hasher.update(serde_json::to_vec(record)?);
                hasher.update(b"\n");
            }
            offset += batch.len();
            if batch.len() < self.config.batch_size.max(1) {
                break;
            }
        }
        Ok(hex_digest(&hasher.finalize()))
    }

    /// Whether `source` and `target` hold identical records in `range`.
    pub async fn verify_integrity(&self, source: &str, target: &str, range: TokenRange) -> Result<bool> {
        Ok(self.range_hash(source, range).await? == self.range_hash(target, range).await?)
    }
}

impl std::fmt::Debug for DataMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataMigrator")
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    records: usize,
    bytes: u64,
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
