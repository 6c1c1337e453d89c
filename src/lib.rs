//! Horizontal scaling layer for the themis multi-model database.
//!
//! This crate splits a themis cluster into shards and provides:
//! - **Consistent hashing** of resource names onto a ring of virtual nodes
//! - **Routing** of point lookups, namespace queries and scatter-gather
//! - **Signed mTLS RPC** between shards, with replay protection and
//!   server-side idempotency
//! - **Rebalancing** of token ranges under operator authorization, with
//!   rollback on failure
//! - **Health checking** that feeds routing decisions
//!
//! # Example
//!
//! ```rust,no_run
//! use themis_shard::config::ShardingConfig;
//! use themis_shard::security::{CertificateRegistry, RequestSigner};
//! use themis_shard::topology::FileMetadataStore;
//! use themis_shard::{ShardNode, Urn};
//! # use std::sync::Arc;
//! # async fn run(
//! #     storage: Arc<dyn themis_shard::routing::LocalExecutor>,
//! #     data: Arc<dyn themis_shard::rebalancing::ShardDataAccess>,
//! #     authorizer: Arc<dyn themis_shard::rebalancing::OperatorAuthorizer>,
//! # ) -> themis_shard::Result<()> {
//! let config = ShardingConfig::from_json_file("/etc/themis/shard.json")?;
//! let certificates = Arc::new(CertificateRegistry::load_json("/etc/themis/certs.json")?);
//! let signer = RequestSigner::from_pem_file("shard_001", "0001", "/etc/themis/signing.pem")?;
//! let metadata = Arc::new(FileMetadataStore::new("/var/lib/themis").await?);
//!
//! let node = ShardNode::with_mtls(config, metadata, certificates, signer, storage, data, authorizer)?;
//! node.bootstrap().await?;
//!
//! let (server, _shutdown) = node.rpc_server("0.0.0.0:8080".parse().unwrap())?;
//! tokio::spawn(server.run());
//!
//! let urn: Urn = "urn:themis:document:acme:orders:123e4567-e89b-12d3-a456-426614174000".parse()?;
//! let order = node.router().get(&urn).await?;
//! println!("{}", order);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          Query layer (outside)              │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │               ShardRouter                   │
//! │  • get / put / del by urn                   │
//! │  • namespace query, scatter-gather, join    │
//! └─────────────────────────────────────────────┘
//!          │                        │
//!          ▼                        ▼
//! ┌─────────────────┐     ┌──────────────────────┐
//! │   UrnResolver   │     │   RemoteExecutor     │
//! │ ring + topology │     │ sign → mTLS → retry  │
//! └─────────────────┘     └──────────────────────┘
//!          ▲                        │
//!          │                        ▼
//! ┌─────────────────┐     ┌──────────────────────┐
//! │ HealthMonitor   │     │ ShardRpcServer (peer)│
//! │ Rebalance coord │     │ verify → dispatch    │
//! └─────────────────┘     └──────────────────────┘
//! ```
//!
//! # Ownership Model
//!
//! - **Ring**: a urn's token is the xxHash64 of its uuid; its owner is the
//!   first virtual node clockwise from the token
//! - **Topology**: every shard on the ring has a descriptor with endpoint,
//!   certificate serial and health flag
//! - **Rebalance**: data is copied first and the ring changes only after a
//!   successful copy (cutover)

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod network;
pub mod node;
pub mod partitioning;
pub mod rebalancing;
pub mod routing;
pub mod security;
pub mod topology;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{RingConfig, ShardingConfig, TlsConfig, TransportConfig};
pub use error::{Error, ErrorKind, Result, ShardError};
pub use node::{NodeComponents, NodeStatistics, ShardNode};
pub use types::{ShardId, Token, TokenRange};

// Re-export partitioning types
pub use partitioning::{ConsistentHashRing, Model, Urn};

// Re-export topology types
pub use topology::{MetadataStore, ShardInfo, ShardTopology, UrnResolver};

// Re-export routing types
pub use routing::{LocalExecutor, MergedResult, RoutingStrategy, ShardRouter};

// Re-export rebalancing types
pub use rebalancing::{
    Cutover, RebalanceCoordinator, RebalanceOperation, RebalanceState, RebalanceStatus,
};

// Re-export health types
pub use health::{ClusterHealth, HealthMonitor, HealthStatus, ShardHealth};

// Re-export metrics types
pub use metrics::{MetricsSnapshot, ShardingMetrics};
