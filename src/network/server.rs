//! Inbound inter-shard RPC over mutually authenticated TLS.
//!
//! Every request body is a [`SignedRequest`] envelope. The envelope must
//! match the HTTP request line and pass [`RequestVerifier::verify`] before
//! anything is dispatched.

use crate::error::{AuthError, Error, ErrorKind, Result};
use crate::metrics::ShardingMetrics;
use crate::network::transport::{normalize_fingerprint, REQUEST_ID_HEADER};
use crate::rebalancing::{dispatch_migration, ShardDataAccess, MIGRATION_PATH};
use crate::routing::{LocalExecutor, ShardRequest};
use crate::security::tls::cert_fingerprint;
use crate::security::{RequestVerifier, SignedRequest};
use crate::topology::ShardTopology;
use crate::types::{now_millis, ShardId};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Health endpoint answered by every shard.
pub const HEALTH_PATH: &str = "/api/v1/health";

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

// ============================================================================
// Idempotency
// ============================================================================

/// Server-side replay cache of answered requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub max_entries: usize,
    pub ttl_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_ms: 300_000,
        }
    }
}

type IdempotencyKey = (ShardId, String);

#[derive(Debug, Default)]
struct IdempotencyState {
    entries: HashMap<IdempotencyKey, (u16, Bytes)>,
    order: VecDeque<(IdempotencyKey, u64)>,
}

/// Responses keyed by `(sender shard, request id)`.
///
/// A retried write carries the same request id as the attempt that timed
/// out on the client, so it is answered from here instead of being applied
/// again. Bounded the same way as the nonce cache.
#[derive(Debug)]
pub struct IdempotencyCache {
    state: Mutex<IdempotencyState>,
    config: IdempotencyConfig,
}

impl IdempotencyCache {
    pub fn new(config: IdempotencyConfig) -> Self {
        Self {
            state: Mutex::new(IdempotencyState::default()),
            config,
        }
    }

    pub fn get(&self, sender: &str, request_id: &str, now_ms: u64) -> Option<(u16, Bytes)> {
        let mut state = self.state.lock();
        self.expire_locked(&mut state, now_ms);
        state
            .entries
            .get(&(sender.to_string(), request_id.to_string()))
            .cloned()
    }

    pub fn insert(&self, sender: &str, request_id: &str, status: u16, body: Bytes, now_ms: u64) {
        let key = (sender.to_string(), request_id.to_string());
        let mut state = self.state.lock();
        if state.entries.insert(key.clone(), (status, body)).is_none() {
            state.order.push_back((key, now_ms));
        }

        if state.entries.len() > self.config.max_entries.max(1) {
            self.expire_locked(&mut state, now_ms);
            if state.entries.len() > self.config.max_entries.max(1) {
                let evict = state.entries.len() / 2;
                for _ in 0..evict {
                    if let Some((key, _)) = state.order.pop_front() {
                        state.entries.remove(&key);
                    }
                }
            }
        }
    }

    fn expire_locked(&self, state: &mut IdempotencyState, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.config.ttl_ms);
        while let Some((_, stored_at)) = state.order.front() {
            if *stored_at >= cutoff {
                break;
            }
            if let Some((key, _)) = state.order.pop_front() {
                state.entries.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Handler
// ============================================================================

/// HTTP status for an error raised while serving a request.
pub fn status_for(error: &Error) -> u16 {
    match error.kind() {
        ErrorKind::Authentication => 401,
        ErrorKind::NotFound => 404,
        ErrorKind::InvalidRequest => 400,
        ErrorKind::StateMachine => 409,
        ErrorKind::Timeout => 504,
        _ => 500,
    }
}

fn error_body(error: &Error) -> Bytes {
    Bytes::from(json!({ "error": error.kind(), "message": error.to_string() }).to_string())
}

/// Verifies envelopes and dispatches them to local storage.
pub struct RpcHandler {
    local_shard_id: ShardId,
    verifier: Arc<RequestVerifier>,
    executor: Arc<dyn LocalExecutor>,
    data: Option<Arc<dyn ShardDataAccess>>,
    topology: Option<Arc<ShardTopology>>,
    idempotency: IdempotencyCache,
    metrics: Arc<ShardingMetrics>,
}

impl RpcHandler {
    pub fn new(
        local_shard_id: impl Into<ShardId>,
        verifier: Arc<RequestVerifier>,
        executor: Arc<dyn LocalExecutor>,
        metrics: Arc<ShardingMetrics>,
    ) -> Self {
        Self {
            local_shard_id: local_shard_id.into(),
            verifier,
            executor,
            data: None,
            topology: None,
            idempotency: IdempotencyCache::new(IdempotencyConfig::default()),
            metrics,
        }
    }

    /// Serve the migration endpoints from `data`.
    pub fn with_data_access(mut self, data: Arc<dyn ShardDataAccess>) -> Self {
        self.data = Some(data);
        self
    }

    /// Check client certificates against fingerprints pinned in `topology`.
    pub fn with_topology(mut self, topology: Arc<ShardTopology>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn with_idempotency(mut self, config: IdempotencyConfig) -> Self {
        self.idempotency = IdempotencyCache::new(config);
        self
    }

    pub fn local_shard_id(&self) -> &str {
        &self.local_shard_id
    }

    pub fn idempotency(&self) -> &IdempotencyCache {
        &self.idempotency
    }

    /// Serve one request. Returns the status and JSON body.
    ///
    /// `peer_fingerprint` is the SHA-256 of the client's leaf certificate
    /// when the request arrived over TLS.
    pub async fn handle(
        &self,
        method: &str,
        path: &str,
        request_id: Option<&str>,
        peer_fingerprint: Option<&str>,
        body: &[u8],
    ) -> (u16, Bytes) {
        let envelope: SignedRequest = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                let err = Error::BadRequest(format!("body is not a signed envelope: {}", e));
                return (status_for(&err), error_body(&err));
            }
        };

        if let Err(e) = self.authenticate(method, path, peer_fingerprint, &envelope) {
            self.metrics.record_auth_rejection(&e);
            let err = Error::Auth(e);
            return (status_for(&err), error_body(&err));
        }
        self.metrics.record_auth_success();

        if let Some(id) = request_id {
            if let Some(cached) = self.idempotency.get(&envelope.shard_id, id, now_millis()) {
                debug!(sender = %envelope.shard_id, request_id = id, "Answering repeated request from cache");
                self.metrics.record_idempotent_replay();
                return cached;
            }
        }

        let (status, response) = match self.dispatch(&envelope).await {
            Ok(value) => (200, Bytes::from(value.to_string())),
            Err(e) => {
                let status = status_for(&e);
                if status >= 500 {
                    warn!(sender = %envelope.shard_id, %path, error = %e, "Request failed");
                } else {
                    debug!(sender = %envelope.shard_id, %path, error = %e, "Request rejected");
                }
                (status, error_body(&e))
            }
        };

        if let Some(id) = request_id {
            if status < 500 {
                self.idempotency
                    .insert(&envelope.shard_id, id, status, response.clone(), now_millis());
            }
        }
        (status, response)
    }

    fn authenticate(
        &self,
        method: &str,
        path: &str,
        peer_fingerprint: Option<&str>,
        envelope: &SignedRequest,
    ) -> std::result::Result<(), AuthError> {
        if !envelope.operation.eq_ignore_ascii_case(method) || envelope.path != path {
            return Err(AuthError::Unauthorized(format!(
                "envelope signs {} {} but request is {} {}",
                envelope.operation, envelope.path, method, path
            )));
        }

        if let (Some(topology), Some(actual)) = (&self.topology, peer_fingerprint) {
            let pinned = topology
                .get_shard(&envelope.shard_id)
                .and_then(|s| s.cert_fingerprint);
            if let Some(expected) = pinned {
                if normalize_fingerprint(&expected) != normalize_fingerprint(actual) {
                    return Err(AuthError::Unauthorized(format!(
                        "client certificate does not match the pin of {}",
                        envelope.shard_id
                    )));
                }
            }
        }

        self.verifier.verify(envelope, None)
    }

    async fn dispatch(&self, envelope: &SignedRequest) -> Result<Value> {
        let method = envelope.operation.to_ascii_uppercase();
        let path = envelope.path.as_str();

        if path == HEALTH_PATH {
            return Ok(json!({
                "shard_id": self.local_shard_id,
                "status": "ok",
                "storage_used_percent": self.executor.storage_used_percent().await,
            }));
        }

        if let Some(action) = path.strip_prefix(MIGRATION_PATH) {
            let data = self
                .data
                .as_deref()
                .ok_or_else(|| Error::NotFound("migration endpoints are disabled".into()))?;
            if method != "POST" {
                return Err(Error::BadRequest(format!("{} not allowed on {}", method, path)));
            }
            return dispatch_migration(data, &self.local_shard_id, action, envelope.body.clone()).await;
        }

        let request = ShardRequest::from_parts(&method, path, envelope.body.clone())?;
        self.executor.execute(&request).await
    }
}

impl std::fmt::Debug for RpcHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcHandler")
            .field("local_shard_id", &self.local_shard_id)
            .field("migration", &self.data.is_some())
            .finish()
    }
}

// ============================================================================
// Server
// ============================================================================

/// mTLS listener feeding an [`RpcHandler`].
pub struct ShardRpcServer {
    bind_addr: SocketAddr,
    acceptor: TlsAcceptor,
    handler: Arc<RpcHandler>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl ShardRpcServer {
    pub fn new(
        bind_addr: SocketAddr,
        tls: Arc<ServerConfig>,
        handler: Arc<RpcHandler>,
    ) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            bind_addr,
            acceptor: TlsAcceptor::from(tls),
            handler,
            shutdown_rx,
        };

        (server, shutdown_tx)
    }

    /// Bind and serve until the shutdown sender fires or is dropped.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(mut self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, shard_id = %self.handler.local_shard_id(), "Shard RPC server listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let acceptor = self.acceptor.clone();
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, acceptor, handler).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Shard RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        acceptor: TlsAcceptor,
        handler: Arc<RpcHandler>,
    ) -> Result<()> {
        let tls = acceptor.accept(stream).await?;
        let fingerprint = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|leaf| cert_fingerprint(leaf.as_ref()));

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let fingerprint = fingerprint.clone();
            async move {
                Ok::<_, Infallible>(Self::serve_request(req, &handler, fingerprint.as_deref()).await)
            }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(tls), service)
            .await
            .map_err(|e| Error::Internal(format!("http connection error: {}", e)))
    }

    async fn serve_request(
        req: Request<Incoming>,
        handler: &RpcHandler,
        fingerprint: Option<&str>,
    ) -> Response<Full<Bytes>> {
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (status, body) = match http_body_util::Limited::new(req.into_body(), MAX_BODY_BYTES)
            .collect()
            .await
        {
            Ok(collected) => {
                handler
                    .handle(&method, &path, request_id.as_deref(), fingerprint, &collected.to_bytes())
                    .await
            }
            Err(e) => {
                let err = Error::BadRequest(format!("failed to read body: {}", e));
                (status_for(&err), error_body(&err))
            }
        };

        let mut response = Response::new(Full::new(body));
        *response.status_mut() =
            hyper::StatusCode::from_u16(status).unwrap_or(hyper::StatusCode::INTERNAL_SERVER_ERROR);
        if let Ok(value) = hyper::header::HeaderValue::from_str("application/json") {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
        response
    }
}
