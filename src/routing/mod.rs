//! Query routing across shards.
//!
//! Record operations go to the single shard owning the identifier. Queries are
//! classified by [`analyze_query`]; fan-out strategies run on every healthy
//! shard concurrently and are combined with [`merge_results`].
//!
//! ```text
//!            ShardRouter
//!     ┌──────────┴──────────┐
//!  single shard        scatter-gather
//!     │                     │
//!  local / remote      JoinSet + Semaphore
//!                           │
//!                      merge + paging
//! ```

mod merge;
mod router;
mod strategy;

pub use merge::{apply_pagination, merge_results, MergedResult, ShardResult};
pub use router::{
    LocalExecutor, RouterConfig, RouterStats, ShardRequest, ShardRouter, DATA_PATH, QUERY_PATH,
};
pub use strategy::{analyze_query, extract_namespace, extract_urn, RoutingStrategy};
