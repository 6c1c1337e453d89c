//! Signed request execution against peer shards.

use crate::error::{Error, Result};
use crate::metrics::ShardingMetrics;
use crate::network::retry::RetryPolicy;
use crate::network::transport::{
    SecureTransport, ShardEndpoint, TransportRequest, REQUEST_ID_HEADER,
};
use crate::routing::ShardRequest;
use crate::security::RequestSigner;
use crate::topology::ShardInfo;
use crate::types::ShardId;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Decoded answer from a peer shard.
#[derive(Debug, Clone)]
pub struct RemoteResponse {
    pub shard_id: ShardId,
    pub status: u16,
    pub body: Value,
    /// Wall time including retries and backoff.
    pub elapsed_ms: u64,
}

/// Sends signed requests to other shards.
///
/// Every attempt is signed afresh, so a retry never trips the receiver's
/// replay cache. All attempts of one call share an idempotency key in the
/// `x-themis-request-id` header, so a write whose response was lost is
/// answered from the receiver's cache instead of being applied twice.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn SecureTransport>,
    signer: RequestSigner,
    retry: RetryPolicy,
    metrics: Arc<ShardingMetrics>,
}

impl RemoteExecutor {
    pub fn new(
        transport: Arc<dyn SecureTransport>,
        signer: RequestSigner,
        retry: RetryPolicy,
        metrics: Arc<ShardingMetrics>,
    ) -> Self {
        Self {
            transport,
            signer,
            retry,
            metrics,
        }
    }

    pub fn local_shard_id(&self) -> &str {
        self.signer.shard_id()
    }

    pub fn transport(&self) -> &Arc<dyn SecureTransport> {
        &self.transport
    }

    pub async fn get(&self, shard: &ShardInfo, path: &str) -> Result<RemoteResponse> {
        self.call(shard, "GET", path, Value::Null).await
    }

    pub async fn post(&self, shard: &ShardInfo, path: &str, body: Value) -> Result<RemoteResponse> {
        self.call(shard, "POST", path, body).await
    }

    pub async fn put(&self, shard: &ShardInfo, path: &str, body: Value) -> Result<RemoteResponse> {
        self.call(shard, "PUT", path, body).await
    }

    pub async fn del(&self, shard: &ShardInfo, path: &str) -> Result<RemoteResponse> {
        self.call(shard, "DELETE", path, Value::Null).await
    }

    /// `POST /api/v1/query` with `{"query": query}`.
    pub async fn execute_query(&self, shard: &ShardInfo, query: &str) -> Result<RemoteResponse> {
        self.post(shard, "/api/v1/query", json!({ "query": query }))
            .await
    }

    /// Run a routed request on `shard` and return the response body.
    pub async fn execute(&self, shard: &ShardInfo, request: &ShardRequest) -> Result<Value> {
        let response = self
            .call(shard, request.method(), &request.path(), request.body())
            .await?;
        Ok(response.body)
    }

    /// One logical call: retried on transport failures, never on an answer.
    pub async fn call(
        &self,
        shard: &ShardInfo,
        method: &str,
        path: &str,
        body: Value,
    ) -> Result<RemoteResponse> {
        let endpoint = ShardEndpoint::for_shard(shard)?;
        let url = format!("{}{}", endpoint.base_url(), path);
        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        let endpoint = &endpoint;
        let request_id = request_id.as_str();
        let body = &body;
        let transport = &self.transport;
        let signer = &self.signer;

        let result = self
            .retry
            .run(
                &url,
                move |_| {
                    let envelope = signer.sign(method, path, body.clone());
                    async move {
                        let payload = serde_json::to_vec(&envelope)?;
                        let request = TransportRequest::new(method, path, payload)
                            .with_header(REQUEST_ID_HEADER, request_id);
                        let response = transport.send(endpoint, request).await?;
                        Ok::<_, Error>(response)
                    }
                },
                |_, _| self.metrics.record_retry(),
            )
            .await;

        let elapsed = start.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.metrics.record_remote_call(false, elapsed);
                warn!(shard_id = %shard.shard_id, %url, elapsed_ms, error = %e, "Remote call failed");
                return Err(e);
            }
        };

        self.metrics
            .record_remote_call(response.is_success(), elapsed);
        debug!(
            shard_id = %shard.shard_id,
            method,
            %url,
            status = response.status,
            elapsed_ms,
            "Remote call completed"
        );

        let body = decode_body(&response.body);
        if !response.is_success() {
            return Err(error_from_response(&shard.shard_id, response.status, &body));
        }

        Ok(RemoteResponse {
            shard_id: shard.shard_id.clone(),
            status: response.status,
            body,
            elapsed_ms,
        })
    }
}

fn decode_body(raw: &[u8]) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
}

/// Map a non-2xx answer to an error. `404` keeps its meaning for callers.
fn error_from_response(shard_id: &str, status: u16, body: &Value) -> Error {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());
    if status == 404 {
        Error::NotFound(message)
    } else {
        Error::Remote {
            shard_id: shard_id.to_string(),
            status,
            message,
        }
    }
}
