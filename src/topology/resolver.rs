//! Identifier to shard resolution.
//!
//! ```text
//!   Urn ──hash()──► ConsistentHashRing ──shard_id──► ShardTopology ──► ShardInfo
//! ```
//!
//! Resolution is read-only: neither the ring nor the topology is mutated, and
//! no lock is held across the two lookups.

use crate::config::DEFAULT_VIRTUAL_NODES;
use crate::error::{ResolutionError, Result};
use crate::partitioning::{ConsistentHashRing, Urn};
use crate::topology::registry::ShardTopology;
use crate::topology::shard::ShardInfo;
use crate::types::ShardId;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// Resolves resource names to owning shards.
#[derive(Debug)]
pub struct UrnResolver {
    topology: Arc<ShardTopology>,
    ring: Arc<ConsistentHashRing>,
    local_shard_id: RwLock<ShardId>,
    default_virtual_nodes: usize,
}

impl UrnResolver {
    pub fn new(
        topology: Arc<ShardTopology>,
        ring: Arc<ConsistentHashRing>,
        local_shard_id: impl Into<ShardId>,
    ) -> Self {
        Self {
            topology,
            ring,
            local_shard_id: RwLock::new(local_shard_id.into()),
            default_virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }

    /// Virtual nodes for ring members whose descriptor does not name a count.
    pub fn with_default_virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.default_virtual_nodes = virtual_nodes;
        self
    }

    /// Owning shard of `urn`, or `None` if the ring is empty or the ring's
    /// answer has no topology entry.
    pub fn resolve_primary(&self, urn: &Urn) -> Option<ShardInfo> {
        let shard_id = self.ring.get_shard_for_urn(urn)?;
        let shard = self.topology.get_shard(&shard_id);
        if shard.is_none() {
            warn!(shard_id = %shard_id, urn = %urn, "Ring entry without topology descriptor");
        }
        shard
    }

    /// Like [`resolve_primary`](Self::resolve_primary) but with a typed error.
    pub fn require_primary(&self, urn: &Urn) -> Result<ShardInfo> {
        if self.ring.is_empty() {
            return Err(ResolutionError::EmptyRing.into());
        }
        self.resolve_primary(urn)
            .ok_or_else(|| ResolutionError::Unroutable(urn.to_string()).into())
    }

    /// Primary followed by up to `replica_count` healthy distinct successors.
    ///
    /// Unhealthy or unknown successors are skipped and do not count.
    pub fn resolve_replicas(&self, urn: &Urn, replica_count: usize) -> Vec<ShardInfo> {
        let successors = self.ring.get_successors(urn.hash(), self.ring.size());
        let mut iter = successors.into_iter();

        let mut result = Vec::with_capacity(replica_count + 1);
        match iter.next().and_then(|id| self.topology.get_shard(&id)) {
            Some(primary) => result.push(primary),
            None => return result,
        }

        for shard_id in iter {
            if result.len() > replica_count {
                break;
            }
            if let Some(shard) = self.topology.get_shard(&shard_id) {
                if shard.is_healthy {
                    result.push(shard);
                }
            }
        }

        result
    }

    /// Whether `urn` is owned by this node.
    pub fn is_local(&self, urn: &Urn) -> bool {
        let local = self.local_shard_id.read();
        !local.is_empty() && self.ring.get_shard_for_urn(urn).as_deref() == Some(local.as_str())
    }

    /// Owning shard id, without consulting the topology.
    pub fn get_shard_id(&self, urn: &Urn) -> Option<ShardId> {
        self.ring.get_shard_for_urn(urn)
    }

    pub fn get_all_shards(&self) -> Vec<ShardInfo> {
        self.topology.get_all_shards()
    }

    pub fn get_healthy_shards(&self) -> Vec<ShardInfo> {
        self.topology.get_healthy_shards()
    }

    /// Reload the topology from its metadata store and bring the ring in
    /// line with it.
    pub async fn refresh_topology(&self) -> Result<usize> {
        let count = self.topology.refresh().await?;
        self.reconcile_ring();
        Ok(count)
    }

    /// Make the ring hold exactly the topology's ring members.
    ///
    /// Shards that are unknown or staged leave the ring; members missing
    /// from it join with their recorded virtual node count. Members already
    /// on the ring keep their tokens. Returns the number of changes.
    pub fn reconcile_ring(&self) -> usize {
        let members: std::collections::HashMap<ShardId, ShardInfo> = self
            .topology
            .get_ring_members()
            .into_iter()
            .map(|s| (s.shard_id.clone(), s))
            .collect();

        let mut changes = 0;
        for shard_id in self.ring.get_all_shards() {
            if !members.contains_key(&shard_id) {
                self.ring.remove_shard(&shard_id);
                info!(shard_id = %shard_id, "Ring entry dropped during reconcile");
                changes += 1;
            }
        }
        for (shard_id, shard) in &members {
            if !self.ring.contains_shard(shard_id) {
                let virtual_nodes = shard.virtual_nodes.unwrap_or(self.default_virtual_nodes);
                self.ring.add_shard(shard_id, virtual_nodes);
                info!(shard_id = %shard_id, virtual_nodes, "Ring entry added during reconcile");
                changes += 1;
            }
        }
        changes
    }

    pub fn local_shard_id(&self) -> ShardId {
        self.local_shard_id.read().clone()
    }

    pub fn set_local_shard_id(&self, shard_id: impl Into<ShardId>) {
        *self.local_shard_id.write() = shard_id.into();
    }

    pub fn topology(&self) -> &Arc<ShardTopology> {
        &self.topology
    }

    pub fn ring(&self) -> &Arc<ConsistentHashRing> {
        &self.ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::topology::store::InMemoryMetadataStore;

    const UUID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn urn(uuid: &str) -> Urn {
        Urn::parse(&format!("urn:themis:document:ns:coll:{}", uuid)).unwrap()
    }

    fn cluster(ids: &[&str], local: &str) -> UrnResolver {
        let topology = Arc::new(ShardTopology::new(
            "test",
            Arc::new(InMemoryMetadataStore::new()),
        ));
        let ring = Arc::new(ConsistentHashRing::new());
        for id in ids {
            topology
                .add_shard(ShardInfo::new(*id, format!("{}:8080", id)))
                .unwrap();
            ring.add_shard(id, 32);
        }
        UrnResolver::new(topology, ring, local)
    }

    #[test]
    fn test_resolve_primary_matches_ring() {
        let resolver = cluster(&["s1", "s2", "s3"], "s1");
        let u = urn(UUID);
        let primary = resolver.resolve_primary(&u).unwrap();
        assert_eq!(Some(primary.shard_id.clone()), resolver.get_shard_id(&u));
        assert_eq!(resolver.is_local(&u), primary.shard_id == "s1");
    }

    #[test]
    fn test_resolve_misses() {
        let resolver = cluster(&[], "s1");
        assert!(resolver.resolve_primary(&urn(UUID)).is_none());
        assert!(matches!(
            resolver.require_primary(&urn(UUID)),
            Err(Error::Resolution(ResolutionError::EmptyRing))
        ));
        assert!(!resolver.is_local(&urn(UUID)));

        // Ring entry without descriptor.
        resolver.ring().add_shard("ghost", 8);
        assert!(resolver.resolve_primary(&urn(UUID)).is_none());
        assert!(matches!(
            resolver.require_primary(&urn(UUID)),
            Err(Error::Resolution(ResolutionError::Unroutable(_)))
        ));
    }

    #[test]
    fn test_replicas_skip_unhealthy() {
        let resolver = cluster(&["s1", "s2", "s3", "s4"], "s1");
        let u = urn(UUID);

        let all = resolver.resolve_replicas(&u, 3);
        assert_eq!(all.len(), 4);

        // Mark the first successor after the primary unhealthy.
        let skipped = all[1].shard_id.clone();
        resolver.topology().update_health(&skipped, false);

        let replicas = resolver.resolve_replicas(&u, 2);
        assert_eq!(replicas.len(), 3);
        assert_eq!(replicas[0].shard_id, all[0].shard_id);
        assert!(replicas.iter().all(|s| s.shard_id != skipped));
        assert_eq!(replicas[1].shard_id, all[2].shard_id);
        assert_eq!(replicas[2].shard_id, all[3].shard_id);
    }

    #[tokio::test]
    async fn test_refresh_topology_reconciles_ring() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let writer = ShardTopology::new("test", store.clone());
        writer.add_shard(ShardInfo::new("s1", "a:1")).unwrap();
        writer
            .add_shard(ShardInfo::new("s2", "b:1").with_virtual_nodes(8))
            .unwrap();
        writer.add_shard(ShardInfo::new("s3", "c:1").staged()).unwrap();
        writer.save().await.unwrap();

        let ring = Arc::new(ConsistentHashRing::new());
        ring.add_shard("ghost", 8);
        ring.add_shard("s3", 8);
        let resolver = UrnResolver::new(
            Arc::new(ShardTopology::new("test", store)),
            ring,
            "s1",
        )
        .with_default_virtual_nodes(4);

        assert_eq!(resolver.refresh_topology().await.unwrap(), 3);
        let mut on_ring = resolver.ring().get_all_shards();
        on_ring.sort();
        assert_eq!(on_ring, vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(resolver.ring().get_shard_virtual_nodes("s1"), 4);
        assert_eq!(resolver.ring().get_shard_virtual_nodes("s2"), 8);
        assert!(resolver.topology().has_shard("s3"));
        for shard_id in resolver.ring().get_all_shards() {
            assert!(resolver.topology().has_shard(&shard_id));
        }
        assert_eq!(resolver.reconcile_ring(), 0);
    }

    #[test]
    fn test_local_shard_id_can_change() {
        let resolver = cluster(&["s1"], "");
        assert!(!resolver.is_local(&urn(UUID)));
        resolver.set_local_shard_id("s1");
        assert!(resolver.is_local(&urn(UUID)));
        assert_eq!(resolver.local_shard_id(), "s1");
    }
}
