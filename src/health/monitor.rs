//! Background health monitoring.

use super::checker::{ClusterHealth, ShardHealthChecker};
use crate::metrics::ShardingMetrics;
use crate::topology::UrnResolver;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Invoked with every completed cluster report.
pub type HealthCallback = Box<dyn Fn(&ClusterHealth) + Send + Sync>;

/// Periodically checks every shard in the topology.
///
/// Each pass flips the topology health flag of every shard (HEALTHY and
/// DEGRADED count as healthy), so the router stops scattering to shards
/// that fail and resumes once they recover.
pub struct HealthMonitor {
    resolver: Arc<UrnResolver>,
    checker: Arc<ShardHealthChecker>,
    metrics: Arc<ShardingMetrics>,
    current: RwLock<Option<ClusterHealth>>,
    callback: RwLock<Option<HealthCallback>>,
}

impl HealthMonitor {
    pub fn new(
        resolver: Arc<UrnResolver>,
        checker: Arc<ShardHealthChecker>,
        metrics: Arc<ShardingMetrics>,
    ) -> Self {
        Self {
            resolver,
            checker,
            metrics,
            current: RwLock::new(None),
            callback: RwLock::new(None),
        }
    }

    pub fn set_callback(&self, callback: HealthCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Last completed report, if any pass has finished.
    pub fn current_health(&self) -> Option<ClusterHealth> {
        self.current.read().clone()
    }

    pub fn checker(&self) -> &Arc<ShardHealthChecker> {
        &self.checker
    }

    /// Run one pass over all shards.
    pub async fn run_once(&self) -> ClusterHealth {
        let topology = self.resolver.topology();
        let shards = topology.get_all_shards();
        let report = self.checker.check_cluster(&shards).await;

        for shard in &report.shards {
            topology.update_health(&shard.shard_id, shard.status.is_serving());
            self.metrics.set_shard_health(&shard.shard_id, shard.status);
        }
        self.metrics.update_cluster_stats(
            topology.shard_count(),
            topology.get_healthy_shards().len(),
            self.resolver.ring().get_virtual_node_count(),
        );

        if !report.has_quorum {
            warn!(
                healthy = report.healthy_shards,
                total = report.total_shards,
                "Cluster has no quorum"
            );
        }

        *self.current.write() = Some(report.clone());
        if let Some(callback) = self.callback.read().as_ref() {
            callback(&report);
        }
        report
    }

    /// Spawn the periodic loop. Send on (or drop) the returned sender to stop it.
    pub fn start(self: Arc<Self>) -> (JoinHandle<()>, mpsc::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let period = self.checker.config().check_interval();

        let handle = tokio::spawn(async move {
            info!(interval_ms = period.as_millis() as u64, "Health monitor started");
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Health monitor shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = self.run_once().await;
                        info!(
                            status = %report.status,
                            healthy = report.healthy_shards,
                            total = report.total_shards,
                            "Health check pass completed"
                        );
                    }
                }
            }
        });

        (handle, shutdown_tx)
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("checker", &self.checker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthCheckConfig, HealthProbe, HealthStatus, ProbeReport};
    use crate::partitioning::ConsistentHashRing;
    use crate::testing::TestKeys;
    use crate::topology::{InMemoryMetadataStore, ShardInfo, ShardTopology};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Every shard answers quickly unless listed as down.
    #[derive(Default)]
    struct SwitchProbe {
        down: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl HealthProbe for SwitchProbe {
        async fn probe(&self, shard: &ShardInfo) -> ProbeReport {
            if self.down.lock().contains(&shard.shard_id) {
                ProbeReport::unreachable("connection refused")
            } else {
                ProbeReport::reachable(1, Some(20.0))
            }
        }
    }

    fn monitor(ids: &[&str], probe: Arc<SwitchProbe>, interval: Duration) -> Arc<HealthMonitor> {
        let keys = TestKeys::new(ids);
        let topology = Arc::new(ShardTopology::new(
            "test",
            Arc::new(InMemoryMetadataStore::new()),
        ));
        let ring = Arc::new(ConsistentHashRing::new());
        for id in ids {
            topology
                .add_shard(ShardInfo::new(*id, format!("{}:7000", id)))
                .unwrap();
            ring.add_shard(id, 16);
        }
        let resolver = Arc::new(UrnResolver::new(topology, ring, ids[0]));
        let metrics = Arc::new(ShardingMetrics::new());
        let config = HealthCheckConfig::default().with_check_interval(interval);
        let checker = Arc::new(ShardHealthChecker::new(config, keys.registry(), probe));
        Arc::new(HealthMonitor::new(resolver, checker, metrics))
    }

    #[test_log::test(tokio::test)]
    async fn test_run_once_updates_topology_health() {
        let probe = Arc::new(SwitchProbe::default());
        let monitor = monitor(&["s1", "s2", "s3"], probe.clone(), Duration::from_secs(60));

        probe.down.lock().insert("s2".to_string());
        let report = monitor.run_once().await;
        assert_eq!(report.healthy_shards, 2);
        assert!(report.has_quorum);
        assert_eq!(report.status, HealthStatus::Critical);

        let topology = monitor.resolver.topology();
        assert!(!topology.get_shard("s2").unwrap().is_healthy);
        assert_eq!(topology.get_healthy_shards().len(), 2);
        assert_eq!(monitor.metrics.cluster_healthy_shards.get(), 2);
        assert_eq!(monitor.metrics.shard_health.get(["s2"]), Some(3));

        probe.down.lock().clear();
        monitor.run_once().await;
        assert!(topology.get_shard("s2").unwrap().is_healthy);
        assert_eq!(monitor.current_health().unwrap().healthy_shards, 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_periodic_loop_invokes_callback_and_stops() {
        let probe = Arc::new(SwitchProbe::default());
        let monitor = monitor(&["s1", "s2"], probe, Duration::from_millis(20));

        let passes = Arc::new(AtomicUsize::new(0));
        let counter = passes.clone();
        monitor.set_callback(Box::new(move |report| {
            assert_eq!(report.total_shards, 2);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let (handle, shutdown) = monitor.clone().start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(passes.load(Ordering::SeqCst) >= 2);
        assert!(monitor.current_health().is_some());
    }
}
