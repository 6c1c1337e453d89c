//! One shard node with every component wired together.
//!
//! [`ShardNode`] owns the ring, topology, router, RPC handler, rebalance
//! coordinator and health monitor of a single shard and exposes the
//! administrative operations that touch more than one of them.

use crate::config::ShardingConfig;
use crate::error::{Error, RebalanceError, Result};
use crate::health::{ClusterHealth, HealthMonitor, RpcHealthProbe, ShardHealthChecker};
use crate::metrics::{MetricsSnapshot, ShardingMetrics};
use crate::network::{MtlsTransport, RemoteExecutor, RetryPolicy, RpcHandler, SecureTransport, ShardRpcServer};
use crate::partitioning::ConsistentHashRing;
use crate::rebalancing::{
    Cutover, MigrationResult, OperatorAuthorizer, RebalanceCoordinator, RebalanceStatus,
    RemoteDataAccess, ShardDataAccess,
};
use crate::routing::{LocalExecutor, RouterStats, ShardRouter};
use crate::security::{tls, CertificateRegistry, RequestSigner, RequestVerifier};
use crate::topology::{MetadataStore, ShardInfo, ShardTopology, UrnResolver};
use crate::types::{ShardId, TokenRange};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// External collaborators a node is assembled from.
pub struct NodeComponents {
    /// Durable home of the topology.
    pub metadata: Arc<dyn MetadataStore>,

    /// Trusted shard certificates.
    pub certificates: Arc<CertificateRegistry>,

    /// Signs outbound requests as this shard.
    pub signer: RequestSigner,

    /// Outbound channel to peers.
    pub transport: Arc<dyn SecureTransport>,

    /// Local query execution.
    pub storage: Arc<dyn LocalExecutor>,

    /// Range access to local storage for migration.
    pub data: Arc<dyn ShardDataAccess>,

    /// Verifies operator signatures before a rebalance starts.
    pub authorizer: Arc<dyn OperatorAuthorizer>,
}

/// Point-in-time view of a node.
#[derive(Debug, Clone)]
pub struct NodeStatistics {
    pub local_shard_id: ShardId,
    pub total_shards: usize,
    pub healthy_shards: usize,
    pub virtual_nodes: usize,
    pub balance_factor: f64,
    pub active_rebalances: usize,
    pub router: RouterStats,
    pub metrics: MetricsSnapshot,
}

/// A fully wired shard.
pub struct ShardNode {
    config: ShardingConfig,
    ring: Arc<ConsistentHashRing>,
    topology: Arc<ShardTopology>,
    resolver: Arc<UrnResolver>,
    router: Arc<ShardRouter>,
    handler: Arc<RpcHandler>,
    coordinator: Arc<RebalanceCoordinator>,
    health: Arc<HealthMonitor>,
    metrics: Arc<ShardingMetrics>,
}

impl ShardNode {
    /// Wire a node from `config` and `components`.
    pub fn new(config: ShardingConfig, components: NodeComponents) -> Result<Self> {
        config.validate()?;
        let local_id = config.local_shard_id.clone();
        let metrics = Arc::new(ShardingMetrics::new());

        let ring = Arc::new(ConsistentHashRing::new());
        let topology = Arc::new(ShardTopology::new(
            config.cluster_name.clone(),
            components.metadata,
        ));
        let resolver = Arc::new(
            UrnResolver::new(topology.clone(), ring.clone(), local_id.clone())
                .with_default_virtual_nodes(config.ring.virtual_nodes),
        );

        let executor = Arc::new(RemoteExecutor::new(
            components.transport,
            components.signer,
            RetryPolicy::from_config(&config.transport),
            metrics.clone(),
        ));

        let router = Arc::new(ShardRouter::new(
            resolver.clone(),
            components.storage.clone(),
            executor.clone(),
            config.router.clone(),
            metrics.clone(),
        ));

        let verifier = Arc::new(RequestVerifier::new(
            config.verifier.clone(),
            components.certificates.clone(),
        ));
        let handler = Arc::new(
            RpcHandler::new(local_id.clone(), verifier, components.storage.clone(), metrics.clone())
                .with_data_access(components.data.clone())
                .with_topology(topology.clone())
                .with_idempotency(config.idempotency.clone()),
        );

        let data = Arc::new(RemoteDataAccess::new(
            local_id.clone(),
            components.data,
            topology.clone(),
            executor.clone(),
        ));
        let coordinator = Arc::new(RebalanceCoordinator::new(
            resolver.clone(),
            data,
            components.authorizer,
            config.migration.clone(),
            config.rebalance.clone(),
            metrics.clone(),
        ));

        let probe = Arc::new(RpcHealthProbe::new(
            local_id,
            components.storage,
            executor,
            config.health.probe_timeout(),
        ));
        let checker = Arc::new(
            ShardHealthChecker::new(config.health.clone(), components.certificates, probe)
                .with_metrics(metrics.clone()),
        );
        let health = Arc::new(HealthMonitor::new(resolver.clone(), checker, metrics.clone()));

        Ok(Self {
            config,
            ring,
            topology,
            resolver,
            router,
            handler,
            coordinator,
            health,
            metrics,
        })
    }

    /// Wire a node whose outbound transport is mTLS per `config.transport`.
    pub fn with_mtls(
        config: ShardingConfig,
        metadata: Arc<dyn MetadataStore>,
        certificates: Arc<CertificateRegistry>,
        signer: RequestSigner,
        storage: Arc<dyn LocalExecutor>,
        data: Arc<dyn ShardDataAccess>,
        authorizer: Arc<dyn OperatorAuthorizer>,
    ) -> Result<Self> {
        let transport = Arc::new(MtlsTransport::new(&config.transport)?);
        Self::new(
            config,
            NodeComponents {
                metadata,
                certificates,
                signer,
                transport,
                storage,
                data,
                authorizer,
            },
        )
    }

    pub fn local_shard_id(&self) -> ShardId {
        self.resolver.local_shard_id()
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    pub fn resolver(&self) -> &Arc<UrnResolver> {
        &self.resolver
    }

    pub fn handler(&self) -> &Arc<RpcHandler> {
        &self.handler
    }

    pub fn coordinator(&self) -> &Arc<RebalanceCoordinator> {
        &self.coordinator
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<ShardingMetrics> {
        &self.metrics
    }

    fn refresh_cluster_stats(&self) {
        self.metrics.update_cluster_stats(
            self.topology.shard_count(),
            self.topology.get_healthy_shards().len(),
            self.ring.get_virtual_node_count(),
        );
    }

    // ========================================================================
    // Topology administration
    // ========================================================================

    /// Load the topology from the metadata store and rebuild the ring from it.
    ///
    /// Ring members already on the ring keep their virtual nodes. Shards no
    /// longer in the topology leave the ring, and staged shards stay off it.
    pub async fn bootstrap(&self) -> Result<usize> {
        let count = self.resolver.refresh_topology().await?;
        self.refresh_cluster_stats();
        info!(shards = count, "Topology loaded");
        Ok(count)
    }

    /// Persist the topology to the metadata store.
    pub async fn save_topology(&self) -> Result<()> {
        self.topology.save().await
    }

    /// Register a shard and put it on the ring with the configured
    /// virtual node count.
    ///
    /// Records in the arcs the shard takes over stay on their previous
    /// owner until copied; use a rebalance with [`Cutover::AddTarget`] to
    /// move them first.
    pub fn add_shard(&self, shard: ShardInfo) -> Result<()> {
        let shard_id = shard.shard_id.clone();
        let virtual_nodes = shard.virtual_nodes.unwrap_or(self.config.ring.virtual_nodes);
        self.topology.add_shard(shard.with_virtual_nodes(virtual_nodes))?;
        self.ring.add_shard(&shard_id, virtual_nodes);
        self.metrics.record_topology_change("shard_added");
        self.refresh_cluster_stats();
        info!(shard_id = %shard_id, "Shard added");
        Ok(())
    }

    /// Register a shard without giving it any part of the ring.
    ///
    /// The shard can receive migrated data and takes ownership through a
    /// rebalance with [`Cutover::AddTarget`].
    pub fn stage_shard(&self, shard: ShardInfo) -> Result<()> {
        let shard_id = shard.shard_id.clone();
        self.topology.add_shard(shard.staged())?;
        self.metrics.record_topology_change("shard_staged");
        self.refresh_cluster_stats();
        info!(shard_id = %shard_id, "Shard staged");
        Ok(())
    }

    /// Take a shard off the ring and out of the topology.
    ///
    /// Refused while the shard takes part in a planned or running rebalance.
    pub fn remove_shard(&self, shard_id: &str) -> Result<ShardInfo> {
        let busy = self.coordinator.list().into_iter().any(|op| {
            op.state.is_active() && (op.source_shard_id == shard_id || op.target_shard_id == shard_id)
        });
        if busy {
            return Err(RebalanceError::ShardBusy(shard_id.to_string()).into());
        }

        self.ring.remove_shard(shard_id);
        let removed = self
            .topology
            .remove_shard(shard_id)
            .ok_or_else(|| crate::error::ResolutionError::UnknownShard(shard_id.to_string()))?;
        self.metrics.remove_shard(shard_id);
        self.metrics.record_topology_change("shard_removed");
        self.refresh_cluster_stats();
        info!(shard_id, "Shard removed");
        Ok(removed)
    }

    // ========================================================================
    // Rebalancing
    // ========================================================================

    /// Plan a move of `range` from `source` to `target`.
    pub fn plan_rebalance(&self, source: &str, target: &str, range: TokenRange) -> Result<RebalanceStatus> {
        Ok(self.coordinator.plan(source, target, range)?.status())
    }

    /// Authorize, copy and cut over a planned operation.
    ///
    /// A failed authorization leaves the operation PLANNED.
    pub async fn start_rebalance(
        &self,
        id: &str,
        operator_signature: &str,
        cutover: Cutover,
    ) -> Result<MigrationResult> {
        self.coordinator.start(id, operator_signature)?;
        let result = self.coordinator.execute(id, cutover).await;
        self.refresh_cluster_stats();
        result
    }

    pub async fn rollback_rebalance(&self, id: &str) -> Result<()> {
        self.coordinator.rollback(id).await
    }

    pub fn rebalance_status(&self, id: &str) -> Result<RebalanceStatus> {
        self.coordinator.status(id)
    }

    pub fn list_rebalances(&self) -> Vec<RebalanceStatus> {
        self.coordinator.list()
    }

    // ========================================================================
    // Health and statistics
    // ========================================================================

    /// Check every shard now and update topology health flags.
    pub async fn cluster_health(&self) -> ClusterHealth {
        self.health.run_once().await
    }

    pub fn statistics(&self) -> NodeStatistics {
        NodeStatistics {
            local_shard_id: self.local_shard_id(),
            total_shards: self.topology.shard_count(),
            healthy_shards: self.topology.get_healthy_shards().len(),
            virtual_nodes: self.ring.get_virtual_node_count(),
            balance_factor: self.ring.get_balance_factor(),
            active_rebalances: self
                .coordinator
                .list()
                .iter()
                .filter(|op| op.state.is_active())
                .count(),
            router: self.router.statistics(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// mTLS server for inbound shard traffic on `bind_addr`.
    pub fn rpc_server(&self, bind_addr: SocketAddr) -> Result<(ShardRpcServer, mpsc::Sender<()>)> {
        let tls = tls::build_server_config(&self.config.transport.tls).map_err(Error::Transport)?;
        Ok(ShardRpcServer::new(bind_addr, tls, self.handler.clone()))
    }
}

impl std::fmt::Debug for ShardNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardNode")
            .field("local_shard_id", &self.local_shard_id())
            .field("cluster", &self.config.cluster_name)
            .field("shards", &self.topology.shard_count())
            .finish()
    }
}
