//! Inter-shard communication.
//!
//! Outbound calls go through [`RemoteExecutor`], which signs each attempt
//! and hands it to a [`SecureTransport`]. Inbound calls are accepted by
//! [`ShardRpcServer`] and verified by [`RpcHandler`] before they reach
//! local storage.

mod executor;
mod mtls;
mod retry;
mod server;
mod transport;

pub use executor::{RemoteExecutor, RemoteResponse};
pub use mtls::MtlsTransport;
pub use retry::RetryPolicy;
pub use server::{
    status_for, IdempotencyCache, IdempotencyConfig, RpcHandler, ShardRpcServer, HEALTH_PATH,
};
pub use transport::{
    normalize_fingerprint, PeerIdentity, SecureTransport, ShardEndpoint, TransportRequest,
    TransportResponse, REQUEST_ID_HEADER,
};
