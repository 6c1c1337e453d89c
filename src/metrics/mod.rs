//! Metrics for the sharding layer.
//!
//! [`ShardingMetrics`] is the narrow recording interface the router, RPC
//! substrate, rebalancer and health monitor write into. Exposition is a
//! text rendering ([`ShardingMetrics::to_prometheus`]); serving it over HTTP
//! is left to the embedding front door.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ShardingMetrics                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │  Counters    │  │   Gauges     │  │   Histograms     │   │
//! │  │ - routes     │  │ - shards     │  │ - route latency  │   │
//! │  │ - rejections │  │ - vnodes     │  │ - rpc latency    │   │
//! │  │ - migration  │  │ - health     │  │ - fan-out, merge │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use themis_shard::metrics::ShardingMetrics;
//! use std::time::Duration;
//!
//! let metrics = ShardingMetrics::new();
//! metrics.record_route("single_shard", true, Duration::from_micros(300));
//! metrics.record_remote_call(false, Duration::from_millis(12));
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.routed_requests, 1);
//! assert_eq!(snapshot.remote_failures, 1);
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use gauges::{FloatGauge, Gauge, LabeledGauge};
pub use histograms::{
    Histogram, HistogramSnapshot, LabeledHistogram, FANOUT_BUCKETS, LATENCY_BUCKETS,
};

use crate::error::AuthError;
use crate::health::HealthStatus;
use std::time::Duration;

/// All metrics recorded by one shard node.
#[derive(Debug)]
pub struct ShardingMetrics {
    // Routing
    pub route_requests: LabeledCounter<1>,
    pub route_errors: LabeledCounter<1>,
    pub route_latency: LabeledHistogram<1>,

    // Remote calls
    pub remote_requests: Counter,
    pub remote_failures: Counter,
    pub remote_retries: Counter,
    pub remote_latency: Histogram,

    // Security
    pub auth_rejections: LabeledCounter<1>,
    pub cert_validations: LabeledCounter<1>,
    pub crl_hits: Counter,
    pub idempotent_replays: Counter,

    // Scatter-gather
    pub scatter_fanout: Histogram,
    pub merge_time: Histogram,

    // Migration and rebalance
    pub migration_records: Counter,
    pub migration_bytes: Counter,
    pub migration_progress: FloatGauge,
    pub rebalance_operations: LabeledCounter<1>,

    // Topology
    pub topology_changes: LabeledCounter<1>,
    pub cluster_shards: Gauge,
    pub cluster_healthy_shards: Gauge,
    pub virtual_nodes: Gauge,
    pub shard_health: LabeledGauge<1>,
}

impl ShardingMetrics {
    pub fn new() -> Self {
        Self {
            route_requests: LabeledCounter::new(
                "themis_shard_route_requests_total",
                "Routed requests by strategy",
                ["strategy"],
            ),
            route_errors: LabeledCounter::new(
                "themis_shard_route_errors_total",
                "Routing failures by error kind",
                ["kind"],
            ),
            route_latency: LabeledHistogram::new(
                "themis_shard_route_latency_seconds",
                "End-to-end routing latency by strategy",
                ["strategy"],
            ),

            remote_requests: Counter::new(
                "themis_shard_remote_requests_total",
                "Signed requests sent to peer shards",
            ),
            remote_failures: Counter::new(
                "themis_shard_remote_failures_total",
                "Signed requests that did not get a 2xx answer",
            ),
            remote_retries: Counter::new(
                "themis_shard_remote_retries_total",
                "Transport-level retries",
            ),
            remote_latency: Histogram::new(
                "themis_shard_remote_latency_seconds",
                "Remote call latency including retries",
            ),

            auth_rejections: LabeledCounter::new(
                "themis_shard_auth_rejections_total",
                "Inbound envelopes rejected by reason",
                ["reason"],
            ),
            cert_validations: LabeledCounter::new(
                "themis_shard_cert_validations_total",
                "Certificate checks by result",
                ["result"],
            ),
            crl_hits: Counter::new(
                "themis_shard_crl_hits_total",
                "Requests signed with a revoked certificate",
            ),
            idempotent_replays: Counter::new(
                "themis_shard_idempotent_replays_total",
                "Requests answered from the idempotency cache",
            ),

            scatter_fanout: Histogram::with_buckets(
                "themis_shard_scatter_fanout",
                "Shards contacted per scatter-gather",
                FANOUT_BUCKETS.to_vec(),
            ),
            merge_time: Histogram::new(
                "themis_shard_merge_seconds",
                "Time spent merging shard results",
            ),

            migration_records: Counter::new(
                "themis_shard_migration_records_total",
                "Records copied by migrations",
            ),
            migration_bytes: Counter::new(
                "themis_shard_migration_bytes_total",
                "Bytes copied by migrations",
            ),
            migration_progress: FloatGauge::new(
                "themis_shard_migration_progress_percent",
                "Progress of the running migration",
            ),
            rebalance_operations: LabeledCounter::new(
                "themis_shard_rebalance_operations_total",
                "Rebalance operations by outcome",
                ["outcome"],
            ),

            topology_changes: LabeledCounter::new(
                "themis_shard_topology_changes_total",
                "Topology mutations by kind",
                ["change"],
            ),
            cluster_shards: Gauge::new("themis_shard_cluster_shards", "Shards in the topology"),
            cluster_healthy_shards: Gauge::new(
                "themis_shard_cluster_healthy_shards",
                "Shards currently marked healthy",
            ),
            virtual_nodes: Gauge::new("themis_shard_virtual_nodes", "Tokens on the hash ring"),
            shard_health: LabeledGauge::new(
                "themis_shard_health_status",
                "Health per shard (0 healthy, 1 degraded, 2 unhealthy, 3 critical)",
                ["shard_id"],
            ),
        }
    }

    /// Record one routed request.
    pub fn record_route(&self, strategy: &str, success: bool, latency: Duration) {
        self.route_requests.inc([strategy]);
        self.route_latency.observe_duration([strategy], latency);
        if !success {
            self.route_errors.inc(["unknown"]);
        }
    }

    /// Record a routing failure by error kind.
    pub fn record_route_error(&self, kind: &str) {
        self.route_errors.inc([kind]);
    }

    pub fn record_remote_call(&self, success: bool, latency: Duration) {
        self.remote_requests.inc();
        if !success {
            self.remote_failures.inc();
        }
        self.remote_latency.observe_duration(latency);
    }

    pub fn record_retry(&self) {
        self.remote_retries.inc();
    }

    /// Record an inbound envelope rejection.
    pub fn record_auth_rejection(&self, error: &AuthError) {
        self.auth_rejections.inc([error.label()]);
        match error {
            AuthError::RevokedCertificate(_) => {
                self.crl_hits.inc();
                self.cert_validations.inc(["revoked"]);
            }
            AuthError::ExpiredCertificate(_) => self.cert_validations.inc(["expired"]),
            AuthError::UnknownCertificate(_) => self.cert_validations.inc(["unknown"]),
            _ => {}
        }
    }

    /// Record an accepted envelope.
    pub fn record_auth_success(&self) {
        self.cert_validations.inc(["valid"]);
    }

    pub fn record_idempotent_replay(&self) {
        self.idempotent_replays.inc();
    }

    pub fn record_scatter(&self, shards: usize, merge_time: Duration) {
        self.scatter_fanout.observe(shards as f64);
        self.merge_time.observe_duration(merge_time);
    }

    pub fn record_migration_batch(&self, records: u64, bytes: u64) {
        self.migration_records.inc_by(records);
        self.migration_bytes.inc_by(bytes);
    }

    pub fn set_migration_progress(&self, percent: f64) {
        self.migration_progress.set(percent);
    }

    /// `outcome` is one of `started`, `completed`, `failed`, `rolled_back`.
    pub fn record_rebalance(&self, outcome: &str) {
        self.rebalance_operations.inc([outcome]);
    }

    pub fn record_topology_change(&self, change: &str) {
        self.topology_changes.inc([change]);
    }

    pub fn update_cluster_stats(&self, total: usize, healthy: usize, virtual_nodes: usize) {
        self.cluster_shards.set(total as i64);
        self.cluster_healthy_shards.set(healthy as i64);
        self.virtual_nodes.set(virtual_nodes as i64);
    }

    pub fn set_shard_health(&self, shard_id: &str, status: HealthStatus) {
        self.shard_health.set([shard_id], status.severity() as i64);
    }

    pub fn remove_shard(&self, shard_id: &str) {
        self.shard_health.remove([shard_id]);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            routed_requests: self.route_requests.total(),
            route_errors: self.route_errors.total(),
            remote_requests: self.remote_requests.get(),
            remote_failures: self.remote_failures.get(),
            remote_retries: self.remote_retries.get(),
            auth_rejections: self.auth_rejections.total(),
            idempotent_replays: self.idempotent_replays.get(),
            migration_records: self.migration_records.get(),
            migration_bytes: self.migration_bytes.get(),
            cluster_shards: self.cluster_shards.get(),
            cluster_healthy_shards: self.cluster_healthy_shards.get(),
            remote_latency: self.remote_latency.snapshot(),
        }
    }

    /// Text exposition of every metric.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        self.route_requests.render(&mut out);
        self.route_errors.render(&mut out);
        self.route_latency.render(&mut out);

        self.remote_requests.render(&mut out);
        self.remote_failures.render(&mut out);
        self.remote_retries.render(&mut out);
        self.remote_latency.render(&mut out);

        self.auth_rejections.render(&mut out);
        self.cert_validations.render(&mut out);
        self.crl_hits.render(&mut out);
        self.idempotent_replays.render(&mut out);

        self.scatter_fanout.render(&mut out);
        self.merge_time.render(&mut out);

        self.migration_records.render(&mut out);
        self.migration_bytes.render(&mut out);
        self.migration_progress.render(&mut out);
        self.rebalance_operations.render(&mut out);

        self.topology_changes.render(&mut out);
        self.cluster_shards.render(&mut out);
        self.cluster_healthy_shards.render(&mut out);
        self.virtual_nodes.render(&mut out);
        self.shard_health.render(&mut out);

        out
    }
}

impl Default for ShardingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time totals.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub routed_requests: u64,
    pub route_errors: u64,
    pub remote_requests: u64,
    pub remote_failures: u64,
    pub remote_retries: u64,
    pub auth_rejections: u64,
    pub idempotent_replays: u64,
    pub migration_records: u64,
    pub migration_bytes: u64,
    pub cluster_shards: i64,
    pub cluster_healthy_shards: i64,
    pub remote_latency: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Fraction of remote calls that succeeded.
    pub fn remote_success_rate(&self) -> f64 {
        if self.remote_requests == 0 {
            1.0
        } else {
            (self.remote_requests - self.remote_failures) as f64 / self.remote_requests as f64
        }
    }

    pub fn avg_remote_latency_ms(&self) -> f64 {
        self.remote_latency.mean() * 1000.0
    }
}
