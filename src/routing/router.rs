//! Request routing: local or remote, single shard or fan-out.

use crate::error::{Error, ErrorKind, Result, ShardError};
use crate::metrics::ShardingMetrics;
use crate::network::RemoteExecutor;
use crate::partitioning::Urn;
use crate::routing::merge::{merge_results, MergedResult, ShardResult};
use crate::routing::strategy::{analyze_query, extract_namespace, extract_urn, RoutingStrategy};
use crate::topology::{ShardInfo, UrnResolver};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Path prefix for record operations.
pub const DATA_PATH: &str = "/api/v1/data/";

/// Path for queries.
pub const QUERY_PATH: &str = "/api/v1/query";

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Deadline for each shard's part of a fan-out.
    pub scatter_timeout_ms: u64,

    /// Upper bound on shards contacted at once during a fan-out.
    pub max_concurrent_shards: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            scatter_timeout_ms: 30_000,
            max_concurrent_shards: 10,
        }
    }
}

impl RouterConfig {
    pub fn with_scatter_timeout(mut self, timeout: Duration) -> Self {
        self.scatter_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_concurrent_shards(mut self, n: usize) -> Self {
        self.max_concurrent_shards = n;
        self
    }

    pub fn scatter_timeout(&self) -> Duration {
        Duration::from_millis(self.scatter_timeout_ms)
    }
}

/// A request addressed to one shard's storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ShardRequest {
    Get { urn: Urn },
    Put { urn: Urn, value: Value },
    Delete { urn: Urn },
    Query { query: String },
}

impl ShardRequest {
    pub fn method(&self) -> &'static str {
        match self {
            ShardRequest::Get { .. } => "GET",
            ShardRequest::Put { .. } => "PUT",
            ShardRequest::Delete { .. } => "DELETE",
            ShardRequest::Query { .. } => "POST",
        }
    }

    pub fn path(&self) -> String {
        match self {
            ShardRequest::Get { urn } | ShardRequest::Put { urn, .. } | ShardRequest::Delete { urn } => {
                format!("{}{}", DATA_PATH, urn)
            }
            ShardRequest::Query { .. } => QUERY_PATH.to_string(),
        }
    }

    pub fn body(&self) -> Value {
        match self {
            ShardRequest::Put { value, .. } => value.clone(),
            ShardRequest::Query { query } => json!({ "query": query }),
            _ => Value::Null,
        }
    }

    pub fn urn(&self) -> Option<&Urn> {
        match self {
            ShardRequest::Get { urn } | ShardRequest::Put { urn, .. } | ShardRequest::Delete { urn } => {
                Some(urn)
            }
            ShardRequest::Query { .. } => None,
        }
    }

    /// Rebuild a request from its HTTP form.
    pub fn from_parts(method: &str, path: &str, body: Value) -> Result<Self> {
        if let Some(raw) = path.strip_prefix(DATA_PATH) {
            let urn = Urn::parse(raw)?;
            return match method {
                "GET" => Ok(ShardRequest::Get { urn }),
                "PUT" => Ok(ShardRequest::Put { urn, value: body }),
                "DELETE" => Ok(ShardRequest::Delete { urn }),
                other => Err(Error::BadRequest(format!("{} not allowed on {}", other, path))),
            };
        }
        if path == QUERY_PATH && method == "POST" {
            let query = body
                .get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::BadRequest("query body must contain a \"query\" string".into()))?;
            return Ok(ShardRequest::Query {
                query: query.to_string(),
            });
        }
        Err(Error::NotFound(format!("no route for {} {}", method, path)))
    }
}

/// Storage on this node. Implemented by the embedding database.
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    /// Execute against local storage. A missing record is `Error::NotFound`.
    async fn execute(&self, request: &ShardRequest) -> Result<Value>;

    /// Percentage of storage capacity in use, if known.
    async fn storage_used_percent(&self) -> Option<f64> {
        None
    }
}

/// Request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub total_requests: u64,
    pub local_requests: u64,
    pub remote_requests: u64,
    pub scatter_gather_requests: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: AtomicU64,
    local_requests: AtomicU64,
    remote_requests: AtomicU64,
    scatter_gather_requests: AtomicU64,
    errors: AtomicU64,
}

/// Top-level entry point for reads, writes and queries.
pub struct ShardRouter {
    resolver: Arc<UrnResolver>,
    local: Arc<dyn LocalExecutor>,
    remote: Arc<RemoteExecutor>,
    config: RouterConfig,
    metrics: Arc<ShardingMetrics>,
    counters: Counters,
}

impl ShardRouter {
    pub fn new(
        resolver: Arc<UrnResolver>,
        local: Arc<dyn LocalExecutor>,
        remote: Arc<RemoteExecutor>,
        config: RouterConfig,
        metrics: Arc<ShardingMetrics>,
    ) -> Self {
        Self {
            resolver,
            local,
            remote,
            config,
            metrics,
            counters: Counters::default(),
        }
    }

    pub fn resolver(&self) -> &Arc<UrnResolver> {
        &self.resolver
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub async fn get(&self, urn: &Urn) -> Result<Value> {
        self.route(ShardRequest::Get { urn: urn.clone() }).await
    }

    pub async fn put(&self, urn: &Urn, value: Value) -> Result<Value> {
        self.route(ShardRequest::Put {
            urn: urn.clone(),
            value,
        })
        .await
    }

    pub async fn del(&self, urn: &Urn) -> Result<Value> {
        self.route(ShardRequest::Delete { urn: urn.clone() }).await
    }

    /// Send a record request to its owning shard.
    pub async fn route(&self, request: ShardRequest) -> Result<Value> {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let result = match request.urn() {
            Some(urn) => {
                let urn = urn.clone();
                self.route_to_owner(&urn, &request).await
            }
            None => Err(Error::BadRequest("request carries no identifier".into())),
        };

        self.finish(RoutingStrategy::SingleShard, &result, start);
        result
    }

    async fn route_to_owner(&self, urn: &Urn, request: &ShardRequest) -> Result<Value> {
        let shard = self.resolver.require_primary(urn)?;
        let local_id = self.resolver.local_shard_id();

        if shard.shard_id == local_id {
            self.counters.local_requests.fetch_add(1, Ordering::Relaxed);
            debug!(shard_id = %shard.shard_id, urn = %urn, op = request.method(), "Executing locally");
            self.local.execute(request).await
        } else {
            self.counters.remote_requests.fetch_add(1, Ordering::Relaxed);
            debug!(shard_id = %shard.shard_id, urn = %urn, op = request.method(), "Forwarding to owner");
            self.remote.execute(&shard, request).await
        }
    }

    fn finish(&self, strategy: RoutingStrategy, result: &Result<Value>, start: Instant) {
        self.metrics
            .record_route(strategy.as_str(), result.is_ok(), start.elapsed());
        if let Err(e) = result {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_route_error(&e.kind().to_string());
        }
    }

    /// Run a query with the strategy [`analyze_query`] picks.
    ///
    /// Single-shard queries return the owner's answer; fan-out strategies
    /// return the merged result as JSON. A query naming an identifier that
    /// does not parse falls back to scatter-gather.
    pub async fn execute_query(&self, query: &str) -> Result<Value> {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let strategy = analyze_query(query);
        debug!(?strategy, "Routing query");

        let request = ShardRequest::Query {
            query: query.to_string(),
        };

        let (strategy, result) = match strategy {
            RoutingStrategy::SingleShard => match extract_urn(query) {
                Some(urn) => (strategy, self.route_to_owner(&urn, &request).await),
                None => {
                    let merged = self.fan_out(query).await;
                    (RoutingStrategy::ScatterGather, Ok(merged.to_json()))
                }
            },
            RoutingStrategy::NamespaceLocal => {
                if let Some(namespace) = extract_namespace(query) {
                    debug!(namespace = %namespace, "No namespace index, fanning out");
                }
                (strategy, Ok(self.fan_out(query).await.to_json()))
            }
            RoutingStrategy::ScatterGather | RoutingStrategy::CrossShardJoin => {
                (strategy, Ok(self.fan_out(query).await.to_json()))
            }
        };

        self.finish(strategy, &result, start);
        result
    }

    async fn fan_out(&self, query: &str) -> MergedResult {
        self.counters
            .scatter_gather_requests
            .fetch_add(1, Ordering::Relaxed);
        let results = self.scatter_gather(query).await;

        let merge_start = Instant::now();
        let merged = merge_results(&results);
        self.metrics
            .record_scatter(results.len(), merge_start.elapsed());

        if merged.is_total_failure() {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(shards = merged.shard_count, "Every shard failed the query");
        } else if merged.error_count > 0 {
            warn!(
                failed = merged.error_count,
                succeeded = merged.success_count,
                "Partial scatter-gather failure"
            );
        }
        merged
    }

    /// Send `query` to every healthy shard concurrently.
    ///
    /// Each shard gets its own timeout; a slow or failing shard becomes an
    /// error entry. Results come back in topology order.
    pub async fn scatter_gather(&self, query: &str) -> Vec<ShardResult> {
        let shards = self.resolver.get_healthy_shards();
        if shards.is_empty() {
            return Vec::new();
        }

        let local_id = self.resolver.local_shard_id();
        let timeout = self.config.scatter_timeout();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_shards.max(1)));
        let request = Arc::new(ShardRequest::Query {
            query: query.to_string(),
        });

        let mut tasks = JoinSet::new();
        for (index, shard) in shards.iter().cloned().enumerate() {
            let is_local = shard.shard_id == local_id;
            if is_local {
                self.counters.local_requests.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.remote_requests.fetch_add(1, Ordering::Relaxed);
            }

            let local = self.local.clone();
            let remote = self.remote.clone();
            let permits = permits.clone();
            let request = request.clone();

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let start = Instant::now();
                let outcome = tokio::time::timeout(
                    timeout,
                    execute_on(&shard, is_local, local.as_ref(), &remote, &request),
                )
                .await;
                let elapsed_ms = start.elapsed().as_millis() as u64;

                let result = match outcome {
                    Ok(Ok(data)) => ShardResult::success(shard.shard_id, data, elapsed_ms),
                    Ok(Err(e)) => ShardResult::failure(e.into_shard_error(shard.shard_id), elapsed_ms),
                    Err(_) => ShardResult::failure(
                        ShardError::new(
                            shard.shard_id,
                            ErrorKind::Timeout,
                            format!("no answer within {}ms", timeout.as_millis()),
                        ),
                        elapsed_ms,
                    ),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<ShardResult>> = vec![None; shards.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!(error = %e, "Scatter task failed"),
            }
        }

        shards
            .into_iter()
            .zip(results)
            .map(|(shard, result)| {
                result.unwrap_or_else(|| {
                    ShardResult::failure(
                        ShardError::new(shard.shard_id, ErrorKind::Internal, "scatter task aborted"),
                        0,
                    )
                })
            })
            .collect()
    }

    /// Two-phase join: scatter the query, then merge on this node. The join
    /// field is not used to look up matching rows on other shards.
    pub async fn execute_cross_shard_join(&self, query: &str, join_field: &str) -> Result<MergedResult> {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        info!(join_field, "Executing cross-shard join as scatter plus merge");

        let merged = self.fan_out(query).await;
        self.metrics
            .record_route(RoutingStrategy::CrossShardJoin.as_str(), !merged.is_total_failure(), start.elapsed());
        Ok(merged)
    }

    pub fn statistics(&self) -> RouterStats {
        RouterStats {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            local_requests: self.counters.local_requests.load(Ordering::Relaxed),
            remote_requests: self.counters.remote_requests.load(Ordering::Relaxed),
            scatter_gather_requests: self.counters.scatter_gather_requests.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}

async fn execute_on(
    shard: &ShardInfo,
    is_local: bool,
    local: &dyn LocalExecutor,
    remote: &RemoteExecutor,
    request: &ShardRequest,
) -> Result<Value> {
    if is_local {
        local.execute(request).await
    } else {
        remote.execute(shard, request).await
    }
}

impl std::fmt::Debug for ShardRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRouter")
            .field("local_shard_id", &self.resolver.local_shard_id())
            .field("config", &self.config)
            .field("stats", &self.statistics())
            .finish()
    }
}
