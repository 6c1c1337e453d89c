//! Shard and cluster health.
//!
//! Three independent signals are folded into one status per shard:
//!
//! ```text
//!   certificate ──┐
//!   storage ──────┼──► ShardHealth ──► ClusterHealth (worst status, quorum)
//!   network ──────┘
//! ```
//!
//! Hard failures (invalid certificate, critical storage, unreachable) make
//! a shard CRITICAL; soft ones make it at least DEGRADED. Losing quorum is
//! reported as a warning, callers decide whether to keep serving.

mod checker;
mod monitor;

pub use checker::{
    has_quorum, ClusterHealth, HealthCheckConfig, HealthProbe, HealthStatus, ProbeReport,
    RpcHealthProbe, ShardHealth, ShardHealthChecker,
};
pub use monitor::{HealthCallback, HealthMonitor};
