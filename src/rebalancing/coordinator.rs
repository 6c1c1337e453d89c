//! Rebalance coordination.
//!
//! The coordinator owns every [`RebalanceOperation`] of this node and drives
//! it through plan, start, copy, cutover and (on failure) rollback.

use crate::error::{Error, RebalanceError, ResolutionError, Result};
use crate::metrics::ShardingMetrics;
use crate::rebalancing::data::ShardDataAccess;
use crate::rebalancing::migrator::{DataMigrator, MigrationConfig, MigrationResult};
use crate::rebalancing::operation::{
    OperatorAuthorizer, RebalanceOperation, RebalanceState, RebalanceStatus,
};
use crate::topology::UrnResolver;
use crate::types::TokenRange;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Rebalance coordination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Roll back automatically when a copy fails.
    pub auto_rollback: bool,

    /// Delete the records the copy added to the target on rollback.
    pub purge_target_on_rollback: bool,

    /// Finished operations kept for status queries.
    pub max_history: usize,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            auto_rollback: true,
            purge_target_on_rollback: true,
            max_history: 100,
        }
    }
}

impl RebalanceConfig {
    pub fn with_auto_rollback(mut self, enabled: bool) -> Self {
        self.auto_rollback = enabled;
        self
    }

    pub fn with_purge_target_on_rollback(mut self, enabled: bool) -> Self {
        self.purge_target_on_rollback = enabled;
        self
    }
}

/// Ring change applied after a successful copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cutover {
    /// Leave the ring alone.
    None,
    /// Put the target on the ring. The copied range must cover every arc
    /// the target takes over.
    AddTarget { virtual_nodes: usize },
    /// Take the source off the ring. Its arcs pass to their successors, so
    /// the target must be the successor of every arc that was copied.
    RemoveSource,
}

/// Plans and runs rebalance operations.
pub struct RebalanceCoordinator {
    resolver: Arc<UrnResolver>,
    data: Arc<dyn ShardDataAccess>,
    migrator: DataMigrator,
    authorizer: Arc<dyn OperatorAuthorizer>,
    config: RebalanceConfig,
    metrics: Arc<ShardingMetrics>,
    operations: RwLock<HashMap<String, Arc<RebalanceOperation>>>,
}

impl RebalanceCoordinator {
    pub fn new(
        resolver: Arc<UrnResolver>,
        data: Arc<dyn ShardDataAccess>,
        authorizer: Arc<dyn OperatorAuthorizer>,
        migration: MigrationConfig,
        config: RebalanceConfig,
        metrics: Arc<ShardingMetrics>,
    ) -> Self {
        let migrator = DataMigrator::new(data.clone(), migration).with_metrics(metrics.clone());
        Self {
            resolver,
            data,
            migrator,
            authorizer,
            config,
            metrics,
            operations: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RebalanceConfig {
        &self.config
    }

    /// Register a new PLANNED operation.
    ///
    /// Both shards must be in the topology and neither may be part of
    /// another planned or running operation.
    pub fn plan(&self, source: &str, target: &str, range: TokenRange) -> Result<Arc<RebalanceOperation>> {
        let topology = self.resolver.topology();
        for shard in [source, target] {
            if !topology.has_shard(shard) {
                return Err(ResolutionError::UnknownShard(shard.to_string()).into());
            }
        }

        let operation = Arc::new(RebalanceOperation::new(source, target, range)?);

        let mut operations = self.operations.write();
        for existing in operations.values() {
            if !existing.state().is_active() {
                continue;
            }
            for shard in [source, target] {
                if existing.source_shard_id() == shard || existing.target_shard_id() == shard {
                    return Err(RebalanceError::ShardBusy(shard.to_string()).into());
                }
            }
        }
        Self::trim_history(&mut operations, self.config.max_history);
        operations.insert(operation.id().to_string(), operation.clone());
        drop(operations);

        info!(operation_id = %operation.id(), source, target, %range, "Rebalance planned");
        self.metrics.record_rebalance("planned");
        Ok(operation)
    }

    fn trim_history(operations: &mut HashMap<String, Arc<RebalanceOperation>>, max_history: usize) {
        let mut finished: Vec<_> = operations
            .values()
            .filter(|op| !op.state().is_active())
            .map(|op| (op.status().created_at_ms, op.id().to_string()))
            .collect();
        if finished.len() < max_history {
            return;
        }
        finished.sort();
        let excess = finished.len() + 1 - max_history.max(1);
        for (_, id) in finished.into_iter().take(excess) {
            operations.remove(&id);
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<RebalanceOperation>> {
        self.operations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RebalanceError::NotFound(id.to_string()).into())
    }

    /// Authorize and move to IN_PROGRESS.
    pub fn start(&self, id: &str, operator_signature: &str) -> Result<()> {
        let operation = self.get(id)?;
        match operation.start(self.authorizer.as_ref(), operator_signature) {
            Ok(()) => {
                self.metrics.record_rebalance("started");
                Ok(())
            }
            Err(e) => {
                if e.is_auth() {
                    self.metrics.record_rebalance("unauthorized");
                }
                Err(e)
            }
        }
    }

    /// Copy the range, apply `cutover` and complete.
    ///
    /// On failure the operation is marked FAILED and, when `auto_rollback`
    /// is set, rolled back before the error is returned.
    pub async fn execute(&self, id: &str, cutover: Cutover) -> Result<MigrationResult> {
        let operation = self.get(id)?;
        let state = operation.state();
        if state != RebalanceState::InProgress {
            return Err(RebalanceError::InvalidTransition {
                from: state.to_string(),
                to: RebalanceState::Completed.to_string(),
            }
            .into());
        }

        let source = operation.source_shard_id().to_string();
        let target = operation.target_shard_id().to_string();
        let tracked = operation.clone();

        let outcome = async {
            self.check_cutover(&source, &target, cutover)?;
            let mut created = BTreeSet::new();
            let copied = self
                .migrator
                .migrate_tracked(&source, &target, operation.range(), &mut created, |progress| {
                    tracked.set_total_records(progress.total_records);
                    tracked.update_progress(progress.records_migrated, progress.bytes_transferred);
                })
                .await;
            operation.set_created_keys(created.into_iter().collect());
            let result = copied?;
            self.apply_cutover(&source, &target, cutover);
            Ok::<_, Error>(result)
        }
        .await;

        match outcome {
            Ok(result) => {
                if let Err(e) = operation.complete() {
                    // Lost a race with fail(); undo the ring change.
                    self.revert_cutover(&source, &target, cutover);
                    return Err(e.into());
                }
                self.metrics.record_rebalance("completed");
                info!(
                    operation_id = %id,
                    records = result.records_migrated,
                    elapsed_ms = result.elapsed_ms,
                    "Rebalance completed"
                );
                Ok(result)
            }
            Err(e) => {
                error!(operation_id = %id, error = %e, "Rebalance copy failed");
                operation.fail(e.to_string())?;
                self.metrics.record_rebalance("failed");
                if self.config.auto_rollback {
                    if let Err(rollback_err) = self.rollback(id).await {
                        warn!(operation_id = %id, error = %rollback_err, "Automatic rollback failed");
                    }
                }
                Err(e)
            }
        }
    }

    fn check_cutover(&self, source: &str, target: &str, cutover: Cutover) -> Result<()> {
        let ring = self.resolver.ring();
        match cutover {
            Cutover::None => Ok(()),
            Cutover::AddTarget { virtual_nodes } => {
                if virtual_nodes == 0 {
                    return Err(RebalanceError::Invalid("cutover needs at least one virtual node".into()).into());
                }
                if ring.contains_shard(target) {
                    return Err(RebalanceError::Invalid(format!("{} is already on the ring", target)).into());
                }
                Ok(())
            }
            Cutover::RemoveSource => {
                if !ring.contains_shard(source) {
                    return Err(RebalanceError::Invalid(format!("{} is not on the ring", source)).into());
                }
                if ring.get_all_shards().len() < 2 {
                    return Err(RebalanceError::Invalid("cannot remove the last shard from the ring".into()).into());
                }
                Ok(())
            }
        }
    }

    fn apply_cutover(&self, source: &str, target: &str, cutover: Cutover) {
        let ring = self.resolver.ring();
        let topology = self.resolver.topology();
        match cutover {
            Cutover::None => {}
            Cutover::AddTarget { virtual_nodes } => {
                ring.add_shard(target, virtual_nodes);
                topology.set_ring_membership(target, Some(virtual_nodes));
                self.metrics.record_topology_change("shard_added");
                info!(shard_id = %target, virtual_nodes, "Cutover: shard added to ring");
            }
            Cutover::RemoveSource => {
                ring.remove_shard(source);
                topology.set_ring_membership(source, None);
                self.metrics.record_topology_change("shard_removed");
                info!(shard_id = %source, "Cutover: shard removed from ring");
            }
        }
    }

    fn revert_cutover(&self, source: &str, target: &str, cutover: Cutover) {
        match cutover {
            Cutover::AddTarget { .. } => {
                self.resolver.ring().remove_shard(target);
                self.resolver.topology().set_ring_membership(target, None);
            }
            Cutover::RemoveSource => {
                warn!(shard_id = %source, "Source left the ring; re-add it manually");
            }
            Cutover::None => {}
        }
    }

    /// `FAILED -> ROLLED_BACK`, deleting from the target the records the
    /// copy added when configured.
    ///
    /// Records the target held in the range before the copy are kept, so a
    /// target that owns arcs of its own keeps serving them.
    pub async fn rollback(&self, id: &str) -> Result<()> {
        let operation = self.get(id)?;
        operation.rollback()?;
        self.metrics.record_rebalance("rolled_back");

        let created = operation.take_created_keys();
        if created.is_empty() {
            info!(operation_id = %id, "Rolled back; nothing was copied");
        } else if self.config.purge_target_on_rollback {
            let purged = self
                .data
                .purge_keys(operation.target_shard_id(), &created)
                .await?;
            info!(operation_id = %id, target = %operation.target_shard_id(), purged, "Rolled back");
        } else {
            info!(operation_id = %id, "Rolled back without purge");
        }
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<RebalanceStatus> {
        Ok(self.get(id)?.status())
    }

    /// All known operations, oldest first.
    pub fn list(&self) -> Vec<RebalanceStatus> {
        let mut statuses: Vec<_> = self.operations.read().values().map(|op| op.status()).collect();
        statuses.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then(a.id.cmp(&b.id)));
        statuses
    }

    /// Whether any operation is planned or running.
    pub fn is_rebalancing(&self) -> bool {
        self.operations.read().values().any(|op| op.state().is_active())
    }
}

impl std::fmt::Debug for RebalanceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceCoordinator")
            .field("config", &self.config)
            .field("operations", &self.operations.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthError, MigrationError};
    use crate::partitioning::ConsistentHashRing;
    use crate::rebalancing::data::MigrationRecord;
    use crate::rebalancing::operation::Ed25519OperatorAuthorizer;
    use crate::testing::MemoryCluster;
    use crate::topology::{InMemoryMetadataStore, ShardInfo, ShardTopology};
    use ed25519_dalek::SigningKey;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        coordinator: RebalanceCoordinator,
        cluster: Arc<MemoryCluster>,
        resolver: Arc<UrnResolver>,
        key: SigningKey,
        metrics: Arc<ShardingMetrics>,
    }

    fn fixture(config: RebalanceConfig) -> Fixture {
        let topology = Arc::new(ShardTopology::new("test", Arc::new(InMemoryMetadataStore::new())));
        for id in ["shard_001", "shard_002"] {
            topology.add_shard(ShardInfo::new(id, format!("{}:8080", id))).unwrap();
        }
        let ring = Arc::new(ConsistentHashRing::new());
        ring.add_shard("shard_001", 16);
        let resolver = Arc::new(UrnResolver::new(topology, ring, "shard_001"));

        let cluster = Arc::new(MemoryCluster::new(&["shard_001", "shard_002"]));
        let records: Vec<_> = (0..12u64)
            .map(|i| MigrationRecord::new(format!("k{}", i), i * 100, json!(i)))
            .collect();
        cluster.seed("shard_001", &records);

        let key = SigningKey::from_bytes(&[21u8; 32]);
        let authorizer = Arc::new(Ed25519OperatorAuthorizer::new());
        authorizer.register_operator("ops", key.verifying_key());

        let metrics = Arc::new(ShardingMetrics::new());
        let migration = MigrationConfig::default()
            .with_batch_size(5)
            .with_retries(0, Duration::from_millis(1));
        let coordinator = RebalanceCoordinator::new(
            resolver.clone(),
            cluster.clone(),
            authorizer,
            migration,
            config,
            metrics.clone(),
        );
        Fixture {
            coordinator,
            cluster,
            resolver,
            key,
            metrics,
        }
    }

    fn start(f: &Fixture, op: &RebalanceOperation) {
        let sig = Ed25519OperatorAuthorizer::sign("ops", &f.key, op);
        f.coordinator.start(op.id(), &sig).unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_full_rebalance_with_add_target_cutover() {
        let f = fixture(RebalanceConfig::default());
        let op = f
            .coordinator
            .plan("shard_001", "shard_002", TokenRange::full())
            .unwrap();
        start(&f, &op);

        let result = f
            .coordinator
            .execute(op.id(), Cutover::AddTarget { virtual_nodes: 16 })
            .await
            .unwrap();
        assert_eq!(result.records_migrated, 12);

        let status = f.coordinator.status(op.id()).unwrap();
        assert_eq!(status.state, RebalanceState::Completed);
        assert_eq!(status.progress.records_migrated, 12);
        assert_eq!(status.progress.progress_percent, 100.0);
        assert!(f.resolver.ring().contains_shard("shard_002"));
        assert_eq!(f.cluster.store("shard_002").len(), 12);
        assert_eq!(f.metrics.rebalance_operations.get(["completed"]), 1);
        assert!(!f.coordinator.is_rebalancing());
    }

    #[tokio::test]
    async fn test_execute_requires_start() {
        let f = fixture(RebalanceConfig::default());
        let op = f
            .coordinator
            .plan("shard_001", "shard_002", TokenRange::full())
            .unwrap();
        let err = f.coordinator.execute(op.id(), Cutover::None).await.unwrap_err();
        assert!(matches!(err, Error::Rebalance(RebalanceError::InvalidTransition { .. })));
        assert_eq!(op.state(), RebalanceState::Planned);
    }

    #[tokio::test]
    async fn test_unauthorized_start_is_rejected() {
        let f = fixture(RebalanceConfig::default());
        let op = f
            .coordinator
            .plan("shard_001", "shard_002", TokenRange::full())
            .unwrap();
        let err = f.coordinator.start(op.id(), "ops:AAAA").unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::MalformedSignature(_))));
        assert_eq!(f.metrics.rebalance_operations.get(["unauthorized"]), 1);
        assert_eq!(op.state(), RebalanceState::Planned);
    }

    #[tokio::test]
    async fn test_plan_validation() {
        let f = fixture(RebalanceConfig::default());
        assert!(matches!(
            f.coordinator.plan("shard_001", "shard_404", TokenRange::full()),
            Err(Error::Resolution(ResolutionError::UnknownShard(_)))
        ));

        f.coordinator
            .plan("shard_001", "shard_002", TokenRange::full())
            .unwrap();
        assert!(matches!(
            f.coordinator.plan("shard_002", "shard_001", TokenRange::new(1, 2).unwrap()),
            Err(Error::Rebalance(RebalanceError::ShardBusy(_)))
        ));
        assert!(f.coordinator.is_rebalancing());
        assert_eq!(f.coordinator.list().len(), 1);
    }

    #[tokio::test]
    async fn test_cutover_precondition_failure_rolls_back() {
        let f = fixture(RebalanceConfig::default());
        let op = f
            .coordinator
            .plan("shard_001", "shard_002", TokenRange::full())
            .unwrap();
        start(&f, &op);

        // Removing the only shard on the ring is refused before any copy.
        let err = f
            .coordinator
            .execute(op.id(), Cutover::RemoveSource)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rebalance(RebalanceError::Invalid(_))));

        let status = op.status();
        assert_eq!(status.state, RebalanceState::RolledBack);
        assert!(status.error_message.is_some());
        assert!(f.cluster.store("shard_002").is_empty());
        assert!(f.resolver.ring().contains_shard("shard_001"));
    }

    #[tokio::test]
    async fn test_failed_copy_without_auto_rollback_waits_for_operator() {
        let f = fixture(RebalanceConfig::default().with_auto_rollback(false));
        let op = f
            .coordinator
            .plan("shard_001", "shard_002", TokenRange::full())
            .unwrap();
        start(&f, &op);

        // Writes to the target fail once, with no retries allowed.
        f.cluster.fail_next_writes("shard_002", 1);
        let err = f.coordinator.execute(op.id(), Cutover::None).await.unwrap_err();
        assert!(matches!(err, Error::Migration(MigrationError::TooManyErrors { .. })));
        assert_eq!(op.state(), RebalanceState::Failed);

        f.coordinator.rollback(op.id()).await.unwrap();
        assert_eq!(op.state(), RebalanceState::RolledBack);
        assert!(f.coordinator.rollback(op.id()).await.is_err());
        assert_eq!(f.metrics.rebalance_operations.get(["rolled_back"]), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_rollback_keeps_records_the_target_already_owned() {
        let f = fixture(RebalanceConfig::default());
        f.cluster.seed(
            "shard_002",
            &[
                MigrationRecord::new("own_a", 50, json!("a")),
                MigrationRecord::new("own_b", 150, json!("b")),
            ],
        );
        let op = f
            .coordinator
            .plan("shard_001", "shard_002", TokenRange::full())
            .unwrap();
        start(&f, &op);

        // Every batch lands, but the target's own records break the range hash.
        let err = f.coordinator.execute(op.id(), Cutover::None).await.unwrap_err();
        assert!(matches!(err, Error::Migration(MigrationError::IntegrityMismatch { .. })));
        assert_eq!(op.state(), RebalanceState::RolledBack);

        let target = f.cluster.store("shard_002");
        assert_eq!(target.keys(), vec!["own_a".to_string(), "own_b".to_string()]);
        assert_eq!(target.get_raw("own_a"), Some(json!("a")));
        assert_eq!(f.cluster.store("shard_001").len(), 12);
    }

    #[test]
    fn test_unknown_operation() {
        let f = fixture(RebalanceConfig::default());
        assert!(matches!(
            f.coordinator.status("nope"),
            Err(Error::Rebalance(RebalanceError::NotFound(_)))
        ));
    }
}
