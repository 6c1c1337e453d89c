//! Configuration types for the sharding layer.
//!
//! Every struct has a `Default` carrying the production defaults and a set of
//! chainable `with_*` builders. All of them deserialize with `#[serde(default)]`
//! so a partial JSON document only needs to name what it overrides.

use crate::error::{Error, Result};
use crate::health::HealthCheckConfig;
use crate::network::IdempotencyConfig;
use crate::rebalancing::{MigrationConfig, RebalanceConfig};
use crate::routing::RouterConfig;
use crate::security::VerifierConfig;
use crate::types::ShardId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of virtual nodes per shard.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Port used when an endpoint carries none.
pub const DEFAULT_PORT: u16 = 8080;

/// Main configuration for one shard node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Cluster name, used as the metadata store key.
    pub cluster_name: String,

    /// Shard id of this node.
    pub local_shard_id: ShardId,

    /// Hash ring configuration.
    pub ring: RingConfig,

    /// Outbound mTLS transport configuration.
    pub transport: TransportConfig,

    /// Inbound signed-request verification.
    pub verifier: VerifierConfig,

    /// Server-side idempotency cache.
    pub idempotency: IdempotencyConfig,

    /// Query routing.
    pub router: RouterConfig,

    /// Batch copy settings.
    pub migration: MigrationConfig,

    /// Rebalance coordination.
    pub rebalance: RebalanceConfig,

    /// Health checking.
    pub health: HealthCheckConfig,
}

impl ShardingConfig {
    /// Create a configuration for the given cluster and local shard.
    pub fn new(cluster_name: impl Into<String>, local_shard_id: impl Into<ShardId>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            local_shard_id: local_shard_id.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the ring configuration.
    pub fn with_ring_config(mut self, ring: RingConfig) -> Self {
        self.ring = ring;
        self
    }

    /// Set the transport configuration.
    pub fn with_transport_config(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Set the verifier configuration.
    pub fn with_verifier_config(mut self, verifier: VerifierConfig) -> Self {
        self.verifier = verifier;
        self
    }

    /// Set the router configuration.
    pub fn with_router_config(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// Set the migration configuration.
    pub fn with_migration_config(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    /// Set the rebalance configuration.
    pub fn with_rebalance_config(mut self, rebalance: RebalanceConfig) -> Self {
        self.rebalance = rebalance;
        self
    }

    /// Set the health check configuration.
    pub fn with_health_config(mut self, health: HealthCheckConfig) -> Self {
        self.health = health;
        self
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.local_shard_id.is_empty() {
            return Err(Error::Config("local_shard_id must not be empty".into()));
        }
        if self.ring.virtual_nodes == 0 {
            return Err(Error::Config("ring.virtual_nodes must be > 0".into()));
        }
        if self.migration.batch_size == 0 {
            return Err(Error::Config("migration.batch_size must be > 0".into()));
        }
        if self.router.max_concurrent_shards == 0 {
            return Err(Error::Config(
                "router.max_concurrent_shards must be > 0".into(),
            ));
        }
        if self.health.storage_warning_threshold_percent
            > self.health.storage_critical_threshold_percent
        {
            return Err(Error::Config(
                "health storage warning threshold exceeds critical threshold".into(),
            ));
        }
        if self.health.response_time_degraded_ms > self.health.response_time_unhealthy_ms {
            return Err(Error::Config(
                "health degraded latency exceeds unhealthy latency".into(),
            ));
        }
        if self.verifier.max_nonce_cache == 0 {
            return Err(Error::Config("verifier.max_nonce_cache must be > 0".into()));
        }
        // An envelope stays acceptable from `now - skew` to `now + skew`; its
        // nonce has to be remembered for that whole span.
        if self.verifier.nonce_expiry_ms < self.verifier.max_time_skew_ms.saturating_mul(2) {
            return Err(Error::Config(
                "verifier.nonce_expiry_ms must be at least twice verifier.max_time_skew_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Hash ring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Virtual nodes created for each shard added without an explicit count.
    pub virtual_nodes: usize,

    /// Number of additional replicas resolved for each identifier.
    pub replication_factor: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            replication_factor: 2,
        }
    }
}

impl RingConfig {
    /// Set the virtual node count.
    pub fn with_virtual_nodes(mut self, n: usize) -> Self {
        self.virtual_nodes = n;
        self
    }

    /// Set the replication factor.
    pub fn with_replication_factor(mut self, n: usize) -> Self {
        self.replication_factor = n;
        self
    }
}

/// Certificate and key material for mutual TLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain presented by this shard.
    pub cert_path: PathBuf,

    /// PEM private key for `cert_path`.
    pub key_path: PathBuf,

    /// PEM bundle of trusted roots used to verify peers.
    pub ca_cert_path: PathBuf,

    /// Optional PEM certificate revocation list.
    pub crl_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Create a TLS configuration from certificate, key and CA paths.
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        ca_cert_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_cert_path: ca_cert_path.into(),
            crl_path: None,
        }
    }

    /// Set the revocation list path.
    pub fn with_crl_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.crl_path = Some(path.into());
        self
    }
}

/// Outbound transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// TLS material.
    pub tls: TlsConfig,

    /// TCP connect plus TLS handshake deadline.
    pub connect_timeout_ms: u64,

    /// Deadline for one request/response exchange.
    pub request_timeout_ms: u64,

    /// Retries after the first attempt, transport failures only.
    pub max_retries: u32,

    /// Delay before the first retry; doubles on each further retry.
    pub retry_delay_ms: u64,

    /// Upper bound for a single backoff delay.
    pub max_retry_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsConfig::default(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
        }
    }
}

impl TransportConfig {
    /// Set TLS material.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set retry count and initial delay.
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
