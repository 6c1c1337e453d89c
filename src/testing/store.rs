//! In-memory shard storage.

use crate::error::{Error, ResolutionError, Result};
use crate::partitioning::{hash_string, Urn};
use crate::rebalancing::{MigrationRecord, ShardDataAccess};
use crate::routing::{extract_namespace, LocalExecutor, ShardRequest};
use crate::types::{ShardId, Token, TokenRange};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// One shard's records keyed by urn string.
#[derive(Debug)]
pub struct MemoryShardStore {
    shard_id: ShardId,
    records: RwLock<BTreeMap<String, (Token, Value)>>,
    storage_used_percent: RwLock<Option<f64>>,
    delay: Mutex<Duration>,
}

impl MemoryShardStore {
    pub fn new(shard_id: impl Into<ShardId>) -> Self {
        Self {
            shard_id: shard_id.into(),
            records: RwLock::new(BTreeMap::new()),
            storage_used_percent: RwLock::new(None),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Store `value` under `key`, placing it by urn hash when `key` is a urn.
    pub fn insert_raw(&self, key: &str, value: Value) {
        let token = Urn::parse(key)
            .map(|urn| urn.hash())
            .unwrap_or_else(|_| hash_string(key));
        self.records.write().insert(key.to_string(), (token, value));
    }

    pub fn get_raw(&self, key: &str) -> Option<Value> {
        self.records.read().get(key).map(|(_, value)| value.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    pub fn set_storage_used_percent(&self, percent: Option<f64>) {
        *self.storage_used_percent.write() = percent;
    }

    /// Delay every query execution by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    fn in_range(&self, range: TokenRange) -> Vec<MigrationRecord> {
        let mut records: Vec<_> = self
            .records
            .read()
            .iter()
            .filter(|(_, (token, _))| range.contains(*token))
            .map(|(key, (token, value))| MigrationRecord::new(key.clone(), *token, value.clone()))
            .collect();
        records.sort_by(|a, b| a.token.cmp(&b.token).then_with(|| a.key.cmp(&b.key)));
        records
    }

    fn check_shard(&self, shard: &str) -> Result<()> {
        if shard != self.shard_id {
            return Err(ResolutionError::UnknownShard(shard.to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl LocalExecutor for MemoryShardStore {
    async fn execute(&self, request: &ShardRequest) -> Result<Value> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match request {
            ShardRequest::Get { urn } => self
                .get_raw(&urn.to_string())
                .ok_or_else(|| Error::NotFound(format!("{} not found on {}", urn, self.shard_id))),
            ShardRequest::Put { urn, value } => {
                self.records
                    .write()
                    .insert(urn.to_string(), (urn.hash(), value.clone()));
                Ok(json!({ "urn": urn.to_string(), "shard_id": self.shard_id }))
            }
            ShardRequest::Delete { urn } => {
                let existed = self.records.write().remove(&urn.to_string()).is_some();
                Ok(json!({ "deleted": existed }))
            }
            ShardRequest::Query { query } => {
                let namespace = extract_namespace(query);
                let records = self.records.read();
                let values = records
                    .iter()
                    .filter(|(key, _)| match &namespace {
                        Some(ns) => Urn::parse(key).map(|u| u.namespace() == ns).unwrap_or(false),
                        None => true,
                    })
                    .map(|(_, (_, value))| value.clone())
                    .collect();
                Ok(Value::Array(values))
            }
        }
    }

    async fn storage_used_percent(&self) -> Option<f64> {
        *self.storage_used_percent.read()
    }
}

#[async_trait]
impl ShardDataAccess for MemoryShardStore {
    async fn fetch_batch(
        &self,
        shard: &str,
        range: TokenRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MigrationRecord>> {
        self.check_shard(shard)?;
        Ok(self.in_range(range).into_iter().skip(offset).take(limit).collect())
    }

    async fn write_batch(&self, shard: &str, records: &[MigrationRecord]) -> Result<usize> {
        self.check_shard(shard)?;
        let mut map = self.records.write();
        for record in records {
            map.insert(record.key.clone(), (record.token, record.value.clone()));
        }
        Ok(records.len())
    }

    async fn count_range(&self, shard: &str, range: TokenRange) -> Result<usize> {
        self.check_shard(shard)?;
        Ok(self
            .records
            .read()
            .values()
            .filter(|(token, _)| range.contains(*token))
            .count())
    }

    async fn purge_range(&self, shard: &str, range: TokenRange) -> Result<usize> {
        self.check_shard(shard)?;
        let mut map = self.records.write();
        let before = map.len();
        map.retain(|_, (token, _)| !range.contains(*token));
        Ok(before - map.len())
    }

    async fn purge_keys(&self, shard: &str, keys: &[String]) -> Result<usize> {
        self.check_shard(shard)?;
        let mut map = self.records.write();
        Ok(keys.iter().filter(|key| map.remove(key.as_str()).is_some()).count())
    }
}

/// Several [`MemoryShardStore`]s addressed by shard id.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    stores: HashMap<ShardId, Arc<MemoryShardStore>>,
    failing_writes: Mutex<HashMap<ShardId, u32>>,
}

impl MemoryCluster {
    pub fn new(shard_ids: &[&str]) -> Self {
        Self {
            stores: shard_ids
                .iter()
                .map(|id| (id.to_string(), Arc::new(MemoryShardStore::new(*id))))
                .collect(),
            failing_writes: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self, shard_id: &str) -> Arc<MemoryShardStore> {
        self.stores[shard_id].clone()
    }

    /// Write `records` to `shard_id` directly.
    pub fn seed(&self, shard_id: &str, records: &[MigrationRecord]) {
        let store = self.store(shard_id);
        let mut map = store.records.write();
        for record in records {
            map.insert(record.key.clone(), (record.token, record.value.clone()));
        }
    }

    /// Make the next `count` writes to `shard_id` fail.
    pub fn fail_next_writes(&self, shard_id: &str, count: u32) {
        self.failing_writes.lock().insert(shard_id.to_string(), count);
    }

    fn get(&self, shard: &str) -> Result<&Arc<MemoryShardStore>> {
        self.stores
            .get(shard)
            .ok_or_else(|| ResolutionError::UnknownShard(shard.to_string()).into())
    }
}

#[async_trait]
impl ShardDataAccess for MemoryCluster {
    async fn fetch_batch(
        &self,
        shard: &str,
        range: TokenRange,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MigrationRecord>> {
        self.get(shard)?.fetch_batch(shard, range, offset, limit).await
    }

    async fn write_batch(&self, shard: &str, records: &[MigrationRecord]) -> Result<usize> {
        {
            let mut failing = self.failing_writes.lock();
            if let Some(left) = failing.get_mut(shard) {
                if *left > 0 {
                    *left -= 1;
                    return Err(Error::Internal(format!("injected write failure on {}", shard)));
                }
            }
        }
        self.get(shard)?.write_batch(shard, records).await
    }

    async fn count_range(&self, shard: &str, range: TokenRange) -> Result<usize> {
        self.get(shard)?.count_range(shard, range).await
    }

    async fn purge_range(&self, shard: &str, range: TokenRange) -> Result<usize> {
        self.get(shard)?.purge_range(shard, range).await
    }

    async fn purge_keys(&self, shard: &str, keys: &[String]) -> Result<usize> {
        self.get(shard)?.purge_keys(shard, keys).await
    }
}
