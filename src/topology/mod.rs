//! Shard topology and identifier resolution.
//!
//! - [`ShardInfo`]: descriptor of one shard (endpoint, locality, health, PKI identity)
//! - [`ShardTopology`]: in-memory registry synchronised with a [`MetadataStore`]
//! - [`UrnResolver`]: ring + topology lookups answering "who owns this urn"

mod registry;
mod resolver;
mod shard;
mod store;

pub use registry::ShardTopology;
pub use resolver::UrnResolver;
pub use shard::{ShardInfo, CAP_ADMIN, CAP_READ, CAP_REPLICATE, CAP_WRITE};
pub use store::{FileMetadataStore, InMemoryMetadataStore, MetadataStore};
