//! Testing utilities for the sharding layer.
//!
//! This module provides in-process stand-ins for everything a shard node
//! talks to, plus end-to-end suites built on them:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           TestCluster                             │
//! │                                                                   │
//! │  ShardNode(shard_001) ─┐                    ┌─ RpcHandler(001)    │
//! │  ShardNode(shard_002) ─┼─ LoopbackTransport ┼─ RpcHandler(002)    │
//! │  ShardNode(shard_00n) ─┘   (down / slow)    └─ RpcHandler(00n)    │
//! │                                                                   │
//! │  MemoryShardStore per shard   TestKeys (one registry, all keys)   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`TestPki`] issues real X.509 material for the suites that go through
//! rustls and hyper.

mod loopback;
mod pki;
mod store;

mod routing_e2e_tests;
mod rpc_e2e_tests;

pub use loopback::LoopbackTransport;
pub use pki::{TestKeys, TestPki};
pub use store::{MemoryCluster, MemoryShardStore};

use crate::config::{RingConfig, ShardingConfig, TransportConfig};
use crate::node::{NodeComponents, ShardNode};
use crate::partitioning::Urn;
use crate::rebalancing::{Ed25519OperatorAuthorizer, MigrationConfig};
use crate::topology::{InMemoryMetadataStore, ShardInfo};
use ed25519_dalek::SigningKey;
use std::sync::Arc;
use std::time::Duration;

/// Virtual nodes per shard in test clusters.
pub const TEST_VIRTUAL_NODES: usize = 32;

/// Operator id registered on every node of a [`TestCluster`].
pub const TEST_OPERATOR: &str = "ops";

/// A set of fully wired shard nodes that reach each other over a
/// [`LoopbackTransport`].
pub struct TestCluster {
    pub nodes: Vec<ShardNode>,
    pub stores: Vec<Arc<MemoryShardStore>>,
    pub transport: Arc<LoopbackTransport>,
    pub keys: TestKeys,
    operator: SigningKey,
}

impl TestCluster {
    /// `size` nodes, every one of them on every node's ring.
    pub fn new(size: usize) -> Self {
        Self::with_config(size, |config| config)
    }

    /// Like [`new`](Self::new), letting the caller adjust each node's config.
    pub fn with_config(size: usize, tweak: impl Fn(ShardingConfig) -> ShardingConfig) -> Self {
        let ids: Vec<String> = (0..size).map(Self::shard_id).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let keys = TestKeys::new(&id_refs);
        let transport = Arc::new(LoopbackTransport::new());
        let operator = SigningKey::from_bytes(&rand::random::<[u8; 32]>());

        let mut nodes = Vec::with_capacity(size);
        let mut stores = Vec::with_capacity(size);
        for (index, id) in ids.iter().enumerate() {
            let store = Arc::new(MemoryShardStore::new(id.as_str()));
            let authorizer = Ed25519OperatorAuthorizer::new();
            authorizer.register_operator(TEST_OPERATOR, operator.verifying_key());

            let config = tweak(
                ShardingConfig::new("test", id.as_str())
                    .with_ring_config(RingConfig::default().with_virtual_nodes(TEST_VIRTUAL_NODES))
                    .with_transport_config(
                        TransportConfig::default().with_retries(0, Duration::from_millis(1)),
                    )
                    .with_migration_config(
                        MigrationConfig::default()
                            .with_batch_size(7)
                            .with_retries(0, Duration::from_millis(1)),
                    ),
            );
            let node = ShardNode::new(
                config,
                NodeComponents {
                    metadata: Arc::new(InMemoryMetadataStore::new()),
                    certificates: keys.registry(),
                    signer: keys.signer(id),
                    transport: transport.clone(),
                    storage: store.clone(),
                    data: store.clone(),
                    authorizer: Arc::new(authorizer),
                },
            )
            .unwrap();
            transport.register(Self::endpoint(index), node.handler().clone());
            nodes.push(node);
            stores.push(store);
        }

        for node in &nodes {
            for index in 0..size {
                node.add_shard(Self::shard_info(index)).unwrap();
            }
        }

        Self {
            nodes,
            stores,
            transport,
            keys,
            operator,
        }
    }

    pub fn shard_id(index: usize) -> String {
        format!("shard_{:03}", index + 1)
    }

    pub fn endpoint(index: usize) -> String {
        format!("10.0.0.{}:7000", index + 1)
    }

    pub fn shard_info(index: usize) -> ShardInfo {
        ShardInfo::new(Self::shard_id(index), Self::endpoint(index))
    }

    fn index_of(shard_id: &str) -> usize {
        shard_id
            .trim_start_matches("shard_")
            .parse::<usize>()
            .unwrap()
            - 1
    }

    pub fn node(&self, shard_id: &str) -> &ShardNode {
        &self.nodes[Self::index_of(shard_id)]
    }

    pub fn store(&self, shard_id: &str) -> &Arc<MemoryShardStore> {
        &self.stores[Self::index_of(shard_id)]
    }

    /// Take a shard's listener down or bring it back.
    pub fn set_down(&self, shard_id: &str, down: bool) {
        self.transport
            .set_down(&Self::endpoint(Self::index_of(shard_id)), down);
    }

    pub fn set_delay(&self, shard_id: &str, delay: Duration) {
        self.transport
            .set_delay(&Self::endpoint(Self::index_of(shard_id)), delay);
    }

    /// Owner of `urn` according to the first node's ring.
    pub fn owner_of(&self, urn: &Urn) -> String {
        self.nodes[0]
            .resolver()
            .get_shard_id(urn)
            .unwrap()
    }

    /// Operator signature for a planned operation on `node`.
    pub fn authorize(&self, node: &ShardNode, operation_id: &str) -> String {
        let operation = node.coordinator().get(operation_id).unwrap();
        Ed25519OperatorAuthorizer::sign(TEST_OPERATOR, &self.operator, &operation)
    }
}

/// A urn in `namespace` with a uuid derived from `n`.
pub fn test_urn(namespace: &str, n: u32) -> Urn {
    Urn::parse(&format!(
        "urn:themis:document:{}:orders:{:08x}-0000-4000-8000-{:012x}",
        namespace, n, n
    ))
    .unwrap()
}
