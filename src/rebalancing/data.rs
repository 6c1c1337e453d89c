//! Record access used by migration.
//!
//! The migrator reads and writes through [`ShardDataAccess`], never through
//! the router, so it can address a shard that does not own the range yet.

use crate::error::{Error, Result};
use crate::network::RemoteExecutor;
use crate::topology::ShardTopology;
use crate::types::{ShardId, Token, TokenRange};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Path prefix of the migration endpoints served by every shard.
pub const MIGRATION_PATH: &str = "/api/v1/migration/";

/// One record in transit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Record identifier, normally a urn string.
    pub key: String,

    /// Ring position of the record.
    pub token: Token,

    pub value: Value,
}

impl MigrationRecord {
    pub fn new(key: impl Into<String>, token: Token, value: Value) -> Self {
        Self {
            key: key.into(),
            token,
            value,
        }
    }

    /// Approximate wire size.
    pub fn size_bytes(&self) -> u64 {
        (self.key.len() + 8 + self.value.to_string().len()) as u64
    }
}

/// Range-scoped record access on any shard.
///
/// Batches are ordered by `(token, key)` so that offsets are stable between
/// calls while the range is not being written to.
#[async_trait]
pub trait ShardDataAccess: Send + Sync {
    /// Up to `limit` records of `shard` within `range`, skipping `offset`.
    async fn fetch_batch(
        &self,
        shard: &str,
        range: TokenRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MigrationRecord>>;

    /// Upsert `records` on `shard`. Returns how many were written.
    async fn write_batch(&self, shard: &str, records: &[MigrationRecord]) -> Result<usize>;

    /// Number of records of `shard` within `range`.
    async fn count_range(&self, shard: &str, range: TokenRange) -> Result<usize>;

    /// Delete every record of `shard` within `range`. Returns how many were removed.
    async fn purge_range(&self, shard: &str, range: TokenRange) -> Result<usize>;

    /// Delete `keys` from `shard`; absent keys are skipped. Returns how many were removed.
    async fn purge_keys(&self, shard: &str, keys: &[String]) -> Result<usize>;
}

#[derive(Debug, Serialize, Deserialize)]
struct FetchBody {
    range: TokenRange,
    offset: usize,
    limit: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct RangeBody {
    range: TokenRange,
}

#[derive(Debug, Serialize, Deserialize)]
struct WriteBody {
    records: Vec<MigrationRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeysBody {
    keys: Vec<String>,
}

fn count_field(body: &Value, field: &str) -> Result<usize> {
    body.get(field)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .ok_or_else(|| Error::Internal(format!("migration response is missing {:?}", field)))
}

/// [`ShardDataAccess`] that calls the migration endpoints of peer shards
/// and serves its own shard from local storage.
pub struct RemoteDataAccess {
    local_shard_id: ShardId,
    local: Arc<dyn ShardDataAccess>,
    topology: Arc<ShardTopology>,
    executor: Arc<RemoteExecutor>,
}

impl RemoteDataAccess {
    pub fn new(
        local_shard_id: impl Into<ShardId>,
        local: Arc<dyn ShardDataAccess>,
        topology: Arc<ShardTopology>,
        executor: Arc<RemoteExecutor>,
    ) -> Self {
        Self {
            local_shard_id: local_shard_id.into(),
            local,
            topology,
            executor,
        }
    }

    fn is_local(&self, shard: &str) -> bool {
        shard == self.local_shard_id
    }

    async fn post(&self, shard: &str, action: &str, body: Value) -> Result<Value> {
        let info = self
            .topology
            .get_shard(shard)
            .ok_or_else(|| crate::error::ResolutionError::UnknownShard(shard.to_string()))?;
        let path = format!("{}{}", MIGRATION_PATH, action);
        debug!(shard_id = %shard, %path, "Migration call");
        Ok(self.executor.post(&info, &path, body).await?.body)
    }
}

#[async_trait]
impl ShardDataAccess for RemoteDataAccess {
    async fn fetch_batch(
        &self,
        shard: &str,
        range: TokenRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MigrationRecord>> {
        if self.is_local(shard) {
            return self.local.fetch_batch(shard, range, offset, limit).await;
        }
        let body = serde_json::to_value(FetchBody {
            range,
            offset,
            limit,
        })?;
        let response = self.post(shard, "fetch", body).await?;
        let records = response
            .get("records")
            .cloned()
            .ok_or_else(|| Error::Internal("migration response is missing \"records\"".into()))?;
        Ok(serde_json::from_value(records)?)
    }

    async fn write_batch(&self, shard: &str, records: &[MigrationRecord]) -> Result<usize> {
        if self.is_local(shard) {
            return self.local.write_batch(shard, records).await;
        }
        let body = json!({ "records": records });
        count_field(&self.post(shard, "write", body).await?, "written")
    }

    async fn count_range(&self, shard: &str, range: TokenRange) -> Result<usize> {
        if self.is_local(shard) {
            return self.local.count_range(shard, range).await;
        }
        let body = serde_json::to_value(RangeBody { range })?;
        count_field(&self.post(shard, "count", body).await?, "count")
    }

    async fn purge_range(&self, shard: &str, range: TokenRange) -> Result<usize> {
        if self.is_local(shard) {
            return self.local.purge_range(shard, range).await;
        }
        let body = serde_json::to_value(RangeBody { range })?;
        count_field(&self.post(shard, "purge", body).await?, "purged")
    }

    async fn purge_keys(&self, shard: &str, keys: &[String]) -> Result<usize> {
        if self.is_local(shard) {
            return self.local.purge_keys(shard, keys).await;
        }
        let body = json!({ "keys": keys });
        count_field(&self.post(shard, "purge_keys", body).await?, "purged")
    }
}

impl std::fmt::Debug for RemoteDataAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDataAccess")
            .field("local_shard_id", &self.local_shard_id)
            .finish()
    }
}

/// Serve a migration endpoint against local storage.
///
/// `action` is the path segment after [`MIGRATION_PATH`].
pub async fn dispatch_migration(
    data: &dyn ShardDataAccess,
    local_shard_id: &str,
    action: &str,
    body: Value,
) -> Result<Value> {
    match action {
        "fetch" => {
            let req: FetchBody = serde_json::from_value(body)
                .map_err(|e| Error::BadRequest(e.to_string()))?;
            let records = data
                .fetch_batch(local_shard_id, req.range, req.offset, req.limit)
                .await?;
            Ok(json!({ "records": records }))
        }
        "write" => {
            let req: WriteBody = serde_json::from_value(body)
                .map_err(|e| Error::BadRequest(e.to_string()))?;
            let written = data.write_batch(local_shard_id, &req.records).await?;
            Ok(json!({ "written": written }))
        }
        "count" => {
            let req: RangeBody = serde_json::from_value(body)
                .map_err(|e| Error::BadRequest(e.to_string()))?;
            let count = data.count_range(local_shard_id, req.range).await?;
            Ok(json!({ "count": count }))
        }
        "purge" => {
            let req: RangeBody = serde_json::from_value(body)
                .map_err(|e| Error::BadRequest(e.to_string()))?;
            let purged = data.purge_range(local_shard_id, req.range).await?;
            Ok(json!({ "purged": purged }))
        }
        "purge_keys" => {
            let req: KeysBody = serde_json::from_value(body)
                .map_err(|e| Error::BadRequest(e.to_string()))?;
            let purged = data.purge_keys(local_shard_id, &req.keys).await?;
            Ok(json!({ "purged": purged }))
        }
        other => Err(Error::NotFound(format!("unknown migration action {:?}", other))),
    }
}
