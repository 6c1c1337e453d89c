//! Moving token ranges between shards.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  RebalanceCoordinator                     │
//! │                                                          │
//! │  plan ──► start (operator signature) ──► execute         │
//! │                                            │              │
//! │            ┌───────────────────────────────┤              │
//! │            ▼                               ▼              │
//! │     DataMigrator                       Cutover            │
//! │  fetch ─► write ─► progress        add target / remove   │
//! │  (batch loop, bounded retries)     source on the ring     │
//! │            │                                              │
//! │            ▼                                              │
//! │   SHA-256 of source range == SHA-256 of target range      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Copying never changes ownership. The ring is only touched by the cutover
//! step, after the copy and its integrity check have succeeded. Concurrent
//! writes to the source during a copy are not captured; the integrity check
//! detects them rather than preventing them.

mod coordinator;
mod data;
mod migrator;
mod operation;

pub use coordinator::{Cutover, RebalanceConfig, RebalanceCoordinator};
pub use data::{
    dispatch_migration, MigrationRecord, RemoteDataAccess, ShardDataAccess, MIGRATION_PATH,
};
pub use migrator::{DataMigrator, MigrationConfig, MigrationProgress, MigrationResult};
pub use operation::{
    Ed25519OperatorAuthorizer, OperatorAuthorizer, ProgressCallback, RebalanceOperation,
    RebalanceProgress, RebalanceState, RebalanceStatus,
};
