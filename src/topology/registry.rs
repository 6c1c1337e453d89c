//! In-memory shard topology backed by a metadata store.

use crate::error::{Error, ResolutionError, Result};
use crate::topology::shard::ShardInfo;
use crate::topology::store::MetadataStore;
use crate::types::ShardId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of shard descriptors for one cluster.
///
/// Reads are served from memory. [`refresh`](Self::refresh) and
/// [`save`](Self::save) synchronise with the metadata store; the lock is never
/// held across the store call, and a failed refresh keeps the last known
/// good topology.
#[derive(Debug)]
pub struct ShardTopology {
    cluster_name: String,
    store: Arc<dyn MetadataStore>,
    shards: RwLock<BTreeMap<ShardId, ShardInfo>>,
}

impl ShardTopology {
    /// Create an empty topology for `cluster_name`.
    pub fn new(cluster_name: impl Into<String>, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            store,
            shards: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Register a new shard.
    pub fn add_shard(&self, shard: ShardInfo) -> Result<()> {
        let mut shards = self.shards.write();
        if shards.contains_key(&shard.shard_id) {
            return Err(ResolutionError::ShardExists(shard.shard_id).into());
        }
        info!(shard_id = %shard.shard_id, endpoint = %shard.primary_endpoint, "Added shard to topology");
        shards.insert(shard.shard_id.clone(), shard);
        Ok(())
    }

    /// Insert or replace a shard descriptor.
    pub fn upsert_shard(&self, shard: ShardInfo) {
        self.shards.write().insert(shard.shard_id.clone(), shard);
    }

    /// Remove a shard, returning its descriptor.
    pub fn remove_shard(&self, shard_id: &str) -> Option<ShardInfo> {
        let removed = self.shards.write().remove(shard_id);
        if removed.is_some() {
            info!(shard_id, "Removed shard from topology");
        }
        removed
    }

    pub fn get_shard(&self, shard_id: &str) -> Option<ShardInfo> {
        self.shards.read().get(shard_id).cloned()
    }

    /// All shards ordered by id.
    pub fn get_all_shards(&self) -> Vec<ShardInfo> {
        self.shards.read().values().cloned().collect()
    }

    /// Shards whose health flag is set.
    pub fn get_healthy_shards(&self) -> Vec<ShardInfo> {
        self.shards
            .read()
            .values()
            .filter(|s| s.is_healthy)
            .cloned()
            .collect()
    }

    /// Update a shard's health flag. Returns `false` for unknown shards.
    pub fn update_health(&self, shard_id: &str, is_healthy: bool) -> bool {
        let mut shards = self.shards.write();
        match shards.get_mut(shard_id) {
            Some(shard) => {
                if shard.is_healthy != is_healthy {
                    info!(shard_id, is_healthy, "Shard health changed");
                }
                shard.is_healthy = is_healthy;
                true
            }
            None => {
                debug!(shard_id, "Health update for unknown shard ignored");
                false
            }
        }
    }

    /// Record that a shard joined the ring with `virtual_nodes` tokens, or
    /// left it when `None`. Returns `false` for unknown shards.
    pub fn set_ring_membership(&self, shard_id: &str, virtual_nodes: Option<usize>) -> bool {
        let mut shards = self.shards.write();
        let Some(shard) = shards.get_mut(shard_id) else {
            return false;
        };
        shard.on_ring = virtual_nodes.is_some();
        if virtual_nodes.is_some() {
            shard.virtual_nodes = virtual_nodes;
        }
        debug!(shard_id, on_ring = shard.on_ring, "Ring membership recorded");
        true
    }

    /// Shards that hold tokens on the ring.
    pub fn get_ring_members(&self) -> Vec<ShardInfo> {
        self.shards
            .read()
            .values()
            .filter(|s| s.on_ring)
            .cloned()
            .collect()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    pub fn has_shard(&self, shard_id: &str) -> bool {
        self.shards.read().contains_key(shard_id)
    }

    pub fn clear(&self) {
        self.shards.write().clear();
    }

    /// Reload the topology from the metadata store.
    pub async fn refresh(&self) -> Result<usize> {
        let loaded = match self.store.load(&self.cluster_name).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(cluster = %self.cluster_name, error = %e, "Topology refresh failed, keeping last known topology");
                return Err(e);
            }
        };

        let count = loaded.len();
        let map: BTreeMap<ShardId, ShardInfo> = loaded
            .into_iter()
            .map(|s| (s.shard_id.clone(), s))
            .collect();
        *self.shards.write() = map;

        debug!(cluster = %self.cluster_name, shards = count, "Topology refreshed");
        Ok(count)
    }

    /// Persist the current topology to the metadata store.
    pub async fn save(&self) -> Result<()> {
        let snapshot = self.get_all_shards();
        self.store
            .save(&self.cluster_name, &snapshot)
            .await
            .map_err(|e| match e {
                Error::Metadata(_) => e,
                other => Error::Metadata(other.to_string()),
            })
    }
}
