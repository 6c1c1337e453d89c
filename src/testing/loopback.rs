//! In-process transport that hands requests straight to peer handlers.

use crate::error::TransportError;
use crate::network::{
    PeerIdentity, RpcHandler, SecureTransport, ShardEndpoint, TransportRequest, TransportResponse,
    REQUEST_ID_HEADER,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Routes each request to the [`RpcHandler`] registered for its authority.
///
/// Peers can be taken down or slowed to exercise failure paths without
/// real sockets.
#[derive(Default)]
pub struct LoopbackTransport {
    handlers: RwLock<HashMap<String, Arc<RpcHandler>>>,
    down: RwLock<HashSet<String>>,
    delays: RwLock<HashMap<String, Duration>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `authority` (`host:port`) with `handler`.
    pub fn register(&self, authority: impl Into<String>, handler: Arc<RpcHandler>) {
        self.handlers.write().insert(authority.into(), handler);
    }

    pub fn set_down(&self, authority: &str, down: bool) {
        let mut set = self.down.write();
        if down {
            set.insert(authority.to_string());
        } else {
            set.remove(authority);
        }
    }

    /// Hold every request to `authority` for `delay` before handling it.
    pub fn set_delay(&self, authority: &str, delay: Duration) {
        self.delays.write().insert(authority.to_string(), delay);
    }

    fn lookup(&self, endpoint: &ShardEndpoint) -> Result<Arc<RpcHandler>, TransportError> {
        let authority = endpoint.authority();
        if self.down.read().contains(&authority) {
            return Err(TransportError::ConnectFailed {
                endpoint: authority,
                reason: "connection refused".into(),
            });
        }
        self.handlers
            .read()
            .get(&authority)
            .cloned()
            .ok_or_else(|| TransportError::ConnectFailed {
                endpoint: authority,
                reason: "no listener".into(),
            })
    }

    fn peer(handler: &RpcHandler) -> PeerIdentity {
        let server_name = format!("{}.themis.local", handler.local_shard_id().replace('_', "-"));
        PeerIdentity::new(server_name, "00")
    }
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("peers", &self.handlers.read().len())
            .finish()
    }
}

#[async_trait]
impl SecureTransport for LoopbackTransport {
    async fn connect(&self, endpoint: &ShardEndpoint) -> Result<PeerIdentity, TransportError> {
        let handler = self.lookup(endpoint)?;
        let peer = Self::peer(&handler);
        self.verify_peer(endpoint, &peer)?;
        Ok(peer)
    }

    async fn send(
        &self,
        endpoint: &ShardEndpoint,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let handler = self.lookup(endpoint)?;
        let peer = Self::peer(&handler);
        self.verify_peer(endpoint, &peer)?;

        let delay = self.delays.read().get(&endpoint.authority()).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (status, body) = handler
            .handle(
                &request.method,
                &request.path,
                request.header(REQUEST_ID_HEADER),
                None,
                &request.body,
            )
            .await;
        Ok(TransportResponse { status, body, peer })
    }
}
