//! Per-shard and cluster health evaluation.

use crate::metrics::ShardingMetrics;
use crate::network::{RemoteExecutor, HEALTH_PATH};
use crate::routing::LocalExecutor;
use crate::security::{CertificateRegistry, CertificateStatus};
use crate::topology::ShardInfo;
use crate::types::{now_millis, ShardId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, warn};

// ============================================================================
// Status
// ============================================================================

/// Health of one shard, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    /// A soft limit was crossed; the shard still serves traffic.
    Degraded,
    /// Too slow to be relied on.
    Unhealthy,
    /// Unusable: bad certificate, full storage or unreachable.
    Critical,
}

impl HealthStatus {
    /// Severity level (0 = healthy, 1 = degraded, 2 = unhealthy, 3 = critical).
    pub fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
            HealthStatus::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unhealthy => "UNHEALTHY",
            HealthStatus::Critical => "CRITICAL",
        }
    }

    /// Whether the shard should keep receiving traffic.
    pub fn is_serving(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Thresholds for health evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// A certificate expiring in fewer days than this degrades the shard.
    pub cert_expiry_warning_days: i64,

    pub storage_warning_threshold_percent: f64,

    pub storage_critical_threshold_percent: f64,

    pub response_time_degraded_ms: u64,

    pub response_time_unhealthy_ms: u64,

    /// Period of the background monitor.
    pub check_interval_ms: u64,

    /// Upper bound on a single probe.
    pub probe_timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            cert_expiry_warning_days: 7,
            storage_warning_threshold_percent: 90.0,
            storage_critical_threshold_percent: 95.0,
            response_time_degraded_ms: 100,
            response_time_unhealthy_ms: 500,
            check_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
        }
    }
}

impl HealthCheckConfig {
    pub fn with_cert_expiry_warning_days(mut self, days: i64) -> Self {
        self.cert_expiry_warning_days = days;
        self
    }

    pub fn with_storage_thresholds(mut self, warning: f64, critical: f64) -> Self {
        self.storage_warning_threshold_percent = warning;
        self.storage_critical_threshold_percent = critical;
        self
    }

    pub fn with_response_time_thresholds(mut self, degraded_ms: u64, unhealthy_ms: u64) -> Self {
        self.response_time_degraded_ms = degraded_ms;
        self.response_time_unhealthy_ms = unhealthy_ms;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// ============================================================================
// Probing
// ============================================================================

/// Raw observations of one probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub reachable: bool,
    pub response_time_ms: u64,
    pub storage_used_percent: Option<f64>,
    pub error: Option<String>,
}

impl ProbeReport {
    pub fn reachable(response_time_ms: u64, storage_used_percent: Option<f64>) -> Self {
        Self {
            reachable: true,
            response_time_ms,
            storage_used_percent,
            error: None,
        }
    }

    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            reachable: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Source of network and storage observations for a shard.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, shard: &ShardInfo) -> ProbeReport;
}

/// Probes the local shard in-process and peers over the signed RPC channel.
pub struct RpcHealthProbe {
    local_shard_id: ShardId,
    local: Arc<dyn LocalExecutor>,
    executor: Arc<RemoteExecutor>,
    timeout: Duration,
}

impl RpcHealthProbe {
    pub fn new(
        local_shard_id: impl Into<ShardId>,
        local: Arc<dyn LocalExecutor>,
        executor: Arc<RemoteExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            local_shard_id: local_shard_id.into(),
            local,
            executor,
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for RpcHealthProbe {
    async fn probe(&self, shard: &ShardInfo) -> ProbeReport {
        let start = Instant::now();
        if shard.shard_id == self.local_shard_id {
            let storage = self.local.storage_used_percent().await;
            return ProbeReport::reachable(start.elapsed().as_millis() as u64, storage);
        }

        match tokio::time::timeout(self.timeout, self.executor.get(shard, HEALTH_PATH)).await {
            Ok(Ok(response)) => {
                let storage = response
                    .body
                    .get("storage_used_percent")
                    .and_then(serde_json::Value::as_f64);
                ProbeReport::reachable(start.elapsed().as_millis() as u64, storage)
            }
            Ok(Err(e)) => ProbeReport::unreachable(e.to_string()),
            Err(_) => ProbeReport::unreachable(format!(
                "no response within {}ms",
                self.timeout.as_millis()
            )),
        }
    }
}

impl std::fmt::Debug for RpcHealthProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcHealthProbe")
            .field("local_shard_id", &self.local_shard_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Evaluated health of one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardHealth {
    pub shard_id: ShardId,
    pub status: HealthStatus,
    pub certificate_valid: bool,
    pub cert_days_until_expiry: Option<i64>,
    pub storage_used_percent: Option<f64>,
    pub network_reachable: bool,
    pub response_time_ms: u64,
    /// Human readable reasons for anything other than HEALTHY.
    pub issues: Vec<String>,
    pub checked_at_ms: u64,
}

/// Cluster-wide roll-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterHealth {
    /// Worst status among all shards.
    pub status: HealthStatus,
    pub total_shards: usize,
    pub healthy_shards: usize,
    pub degraded_shards: usize,
    pub unhealthy_shards: usize,
    pub critical_shards: usize,
    pub has_quorum: bool,
    pub shards: Vec<ShardHealth>,
    pub warnings: Vec<String>,
    pub checked_at_ms: u64,
}

impl ClusterHealth {
    pub fn shard(&self, shard_id: &str) -> Option<&ShardHealth> {
        self.shards.iter().find(|s| s.shard_id == shard_id)
    }
}

/// More than half of all shards are HEALTHY. DEGRADED shards do not count.
pub fn has_quorum(healthy_shards: usize, total_shards: usize) -> bool {
    total_shards > 0 && healthy_shards > total_shards / 2
}

// ============================================================================
// Checker
// ============================================================================

/// Folds certificate, storage and network signals into a [`HealthStatus`].
pub struct ShardHealthChecker {
    config: HealthCheckConfig,
    certificates: Arc<CertificateRegistry>,
    probe: Arc<dyn HealthProbe>,
    metrics: Option<Arc<ShardingMetrics>>,
}

impl ShardHealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        certificates: Arc<CertificateRegistry>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            config,
            certificates,
            probe,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ShardingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    fn certificate_status(&self, shard: &ShardInfo, now_ms: u64) -> Option<CertificateStatus> {
        if !shard.certificate_serial.is_empty() {
            return self.certificates.status(&shard.certificate_serial, now_ms);
        }
        let cert = self.certificates.find_by_shard(&shard.shard_id)?;
        self.certificates.status(&cert.serial_number, now_ms)
    }

    /// Evaluate already gathered signals. Pure.
    pub fn evaluate(
        &self,
        shard_id: &str,
        certificate: Option<&CertificateStatus>,
        probe: &ProbeReport,
        now_ms: u64,
    ) -> ShardHealth {
        let mut status = HealthStatus::Healthy;
        let mut issues = Vec::new();
        let mut raise = |level: HealthStatus, issue: String| {
            status = status.max(level);
            issues.push(issue);
        };

        match certificate {
            None => raise(HealthStatus::Critical, "no certificate registered".to_string()),
            Some(cert) if cert.revoked => raise(
                HealthStatus::Critical,
                format!("certificate {} is revoked", cert.serial_number),
            ),
            Some(cert) if !cert.valid => raise(
                HealthStatus::Critical,
                format!("certificate {} is not valid", cert.serial_number),
            ),
            Some(cert) if cert.days_until_expiry < self.config.cert_expiry_warning_days => raise(
                HealthStatus::Degraded,
                format!("certificate expires in {} days", cert.days_until_expiry),
            ),
            Some(_) => {}
        }

        if let Some(used) = probe.storage_used_percent {
            if used >= self.config.storage_critical_threshold_percent {
                raise(HealthStatus::Critical, format!("storage {:.1}% used", used));
            } else if used >= self.config.storage_warning_threshold_percent {
                raise(HealthStatus::Degraded, format!("storage {:.1}% used", used));
            }
        }

        if !probe.reachable {
            let reason = probe.error.as_deref().unwrap_or("no response");
            raise(HealthStatus::Critical, format!("unreachable: {}", reason));
        } else if probe.response_time_ms >= self.config.response_time_unhealthy_ms {
            raise(
                HealthStatus::Unhealthy,
                format!("response time {}ms", probe.response_time_ms),
            );
        } else if probe.response_time_ms >= self.config.response_time_degraded_ms {
            raise(
                HealthStatus::Degraded,
                format!("response time {}ms", probe.response_time_ms),
            );
        }

        ShardHealth {
            shard_id: shard_id.to_string(),
            status,
            certificate_valid: certificate.map(|c| c.valid).unwrap_or(false),
            cert_days_until_expiry: certificate.map(|c| c.days_until_expiry),
            storage_used_percent: probe.storage_used_percent,
            network_reachable: probe.reachable,
            response_time_ms: probe.response_time_ms,
            issues,
            checked_at_ms: now_ms,
        }
    }

    /// Probe and evaluate one shard.
    pub async fn check_shard(&self, shard: &ShardInfo) -> ShardHealth {
        let report = self.probe.probe(shard).await;
        let now = now_millis();
        let cert = self.certificate_status(shard, now);
        let health = self.evaluate(&shard.shard_id, cert.as_ref(), &report, now);

        if health.status == HealthStatus::Healthy {
            debug!(shard_id = %shard.shard_id, response_time_ms = report.response_time_ms, "Shard healthy");
        } else {
            warn!(
                shard_id = %shard.shard_id,
                status = %health.status,
                issues = ?health.issues,
                "Shard not healthy"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_shard_health(&shard.shard_id, health.status);
        }
        health
    }

    /// Probe every shard concurrently and roll the results up.
    pub async fn check_cluster(self: &Arc<Self>, shards: &[ShardInfo]) -> ClusterHealth {
        let mut tasks = JoinSet::new();
        for (index, shard) in shards.iter().cloned().enumerate() {
            let checker = Arc::clone(self);
            tasks.spawn(async move { (index, checker.check_shard(&shard).await) });
        }

        let mut results: Vec<Option<ShardHealth>> = vec![None; shards.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, health)) => results[index] = Some(health),
                Err(e) => warn!(error = %e, "Health check task failed"),
            }
        }

        let now = now_millis();
        let shard_health = results
            .into_iter()
            .zip(shards)
            .map(|(health, shard)| {
                health.unwrap_or_else(|| {
                    self.evaluate(
                        &shard.shard_id,
                        None,
                        &ProbeReport::unreachable("health check aborted"),
                        now,
                    )
                })
            })
            .collect();
        Self::aggregate(shard_health)
    }

    /// Roll shard reports up into a cluster report.
    pub fn aggregate(shards: Vec<ShardHealth>) -> ClusterHealth {
        let count = |status: HealthStatus| shards.iter().filter(|s| s.status == status).count();
        let total = shards.len();
        let healthy = count(HealthStatus::Healthy);
        let quorum = has_quorum(healthy, total);

        let mut warnings = Vec::new();
        if !quorum {
            warnings.push(format!(
                "No quorum: {} of {} shards healthy",
                healthy, total
            ));
        }

        ClusterHealth {
            status: shards
                .iter()
                .map(|s| s.status)
                .max()
                .unwrap_or(HealthStatus::Healthy),
            total_shards: total,
            healthy_shards: healthy,
            degraded_shards: count(HealthStatus::Degraded),
            unhealthy_shards: count(HealthStatus::Unhealthy),
            critical_shards: count(HealthStatus::Critical),
            has_quorum: quorum,
            warnings,
            checked_at_ms: now_millis(),
            shards,
        }
    }
}

impl std::fmt::Debug for ShardHealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardHealthChecker")
            .field("config", &self.config)
            .finish()
    }
}
