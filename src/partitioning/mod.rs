//! Partitioning module for placing records on shards.
//!
//! This module implements consistent hashing for record placement, ensuring:
//! - Even distribution of records across shards (virtual nodes)
//! - Minimal re-placement when shards join/leave
//! - Distinct successor lists for replica selection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ConsistentHashRing                          │
//! │  ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐           │
//! │  │s1#0 │→│s2#4 │→│s3#1 │→│s1#7 │→│s2#0 │→│s3#9 │→ (wrap)   │
//! │  └─────┘ └─────┘ └─────┘ └─────┘ └─────┘ └─────┘           │
//! │        150 virtual nodes per shard by default               │
//! └─────────────────────────────────────────────────────────────┘
//!
//!  urn:themis:document:ns:orders:550e8400-...
//!        │
//!        ▼ xxh64(uuid)
//!  first token >= hash → shard_2 (primary)
//!                      → shard_3 (next distinct successor)
//! ```
//!
//! # Example
//!
//! ```rust
//! use themis_shard::partitioning::{ConsistentHashRing, Urn};
//!
//! let ring = ConsistentHashRing::new();
//! ring.add_shard("shard_001", 150);
//! ring.add_shard("shard_002", 150);
//!
//! let urn = Urn::parse("urn:themis:document:tenant:orders:550e8400-e29b-41d4-a716-446655440000").unwrap();
//! let owner = ring.get_shard_for_urn(&urn);
//! assert!(owner.is_some());
//!
//! let replicas = ring.get_successors(urn.hash(), 2);
//! assert_eq!(replicas.len(), 2);
//! ```

mod hashring;
mod urn;

pub use hashring::{hash_string, ConsistentHashRing, OwnershipChange};
pub use urn::{Model, Urn};
