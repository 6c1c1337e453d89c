//! RPC E2E Test Suite
//!
//! Real sockets, real certificates: a [`ShardRpcServer`](crate::network::ShardRpcServer)
//! on `127.0.0.1` answers a [`RemoteExecutor`](crate::network::RemoteExecutor)
//! that talks through [`MtlsTransport`](crate::network::MtlsTransport).
//!
//! | Test ID    | Scenario                          | Verification                         |
//! |------------|-----------------------------------|--------------------------------------|
//! | TC_RPC_01  | Signed put/get over mTLS          | Record stored, value read back       |
//! | TC_RPC_02  | Health endpoint                   | Reports shard id and storage usage   |
//! | TC_RPC_03  | Wrong server fingerprint pin      | PeerMismatch, request never sent     |
//! | TC_RPC_04  | Client pin checked by the server  | Mismatch is 401, matching pin passes |
//! | TC_RPC_05  | Server shutdown                   | Listener closes, connect fails       |

#[cfg(test)]
mod tests {
    use crate::config::TransportConfig;
    use crate::error::{Error, TransportError};
    use crate::metrics::ShardingMetrics;
    use crate::network::{
        MtlsTransport, RemoteExecutor, RetryPolicy, RpcHandler, ShardRpcServer, HEALTH_PATH,
    };
    use crate::partitioning::Urn;
    use crate::routing::ShardRequest;
    use crate::security::tls::{build_server_config, fingerprint_file};
    use crate::security::{RequestVerifier, VerifierConfig};
    use crate::testing::{test_urn, MemoryShardStore, TestKeys, TestPki};
    use crate::topology::{InMemoryMetadataStore, ShardInfo, ShardTopology};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    struct Harness {
        pki: TestPki,
        keys: TestKeys,
        store: Arc<MemoryShardStore>,
        server_cert: PathBuf,
        target: ShardInfo,
        shutdown: mpsc::Sender<()>,
        server: JoinHandle<crate::error::Result<()>>,
    }

    impl Harness {
        async fn start() -> Self {
            Self::start_with(|handler| handler).await
        }

        async fn start_with(extend: impl FnOnce(RpcHandler) -> RpcHandler) -> Self {
            let pki = TestPki::new();
            let keys = TestKeys::new(&["shard_001", "shard_002"]);
            let store = Arc::new(MemoryShardStore::new("shard_002"));
            let verifier = Arc::new(RequestVerifier::new(VerifierConfig::default(), keys.registry()));
            let handler = extend(RpcHandler::new(
                "shard_002",
                verifier,
                store.clone(),
                Arc::new(ShardingMetrics::new()),
            ));

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let server_tls = pki.issue("shard-002.themis.local");
            let tls = build_server_config(&server_tls).unwrap();
            let (server, shutdown) = ShardRpcServer::new(addr, tls, Arc::new(handler));
            let server = tokio::spawn(server.serve(listener));

            let target = ShardInfo::new("shard_002", addr.to_string());
            Self {
                pki,
                keys,
                store,
                server_cert: server_tls.cert_path,
                target,
                shutdown,
                server,
            }
        }

        fn client(&self) -> RemoteExecutor {
            let config = TransportConfig::default()
                .with_tls(self.pki.issue("shard-001.themis.local"))
                .with_connect_timeout(Duration::from_secs(2))
                .with_retries(0, Duration::from_millis(1));
            RemoteExecutor::new(
                Arc::new(MtlsTransport::new(&config).unwrap()),
                self.keys.signer("shard_001"),
                RetryPolicy::from_config(&config),
                Arc::new(ShardingMetrics::new()),
            )
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_signed_put_and_get_over_mtls() {
        let harness = Harness::start().await;
        let client = harness.client();
        let urn: Urn = test_urn("acme", 7);

        let put = ShardRequest::Put {
            urn: urn.clone(),
            value: json!({"total": 99}),
        };
        let written = client.execute(&harness.target, &put).await.unwrap();
        assert_eq!(written["shard_id"], "shard_002");
        assert_eq!(harness.store.get_raw(&urn.to_string()), Some(json!({"total": 99})));

        let value = client
            .execute(&harness.target, &ShardRequest::Get { urn: urn.clone() })
            .await
            .unwrap();
        assert_eq!(value, json!({"total": 99}));

        let missing = test_urn("acme", 8);
        let err = client
            .execute(&harness.target, &ShardRequest::Get { urn: missing })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{err:?}");
    }

    #[test_log::test(tokio::test)]
    async fn test_health_endpoint() {
        let harness = Harness::start().await;
        harness.store.set_storage_used_percent(Some(42.5));

        let response = harness.client().get(&harness.target, HEALTH_PATH).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.shard_id, "shard_002");
        assert_eq!(response.body["shard_id"], "shard_002");
        assert_eq!(response.body["status"], "ok");
        assert_eq!(response.body["storage_used_percent"], 42.5);
    }

    #[test_log::test(tokio::test)]
    async fn test_wrong_server_fingerprint_is_rejected_before_sending() {
        let harness = Harness::start().await;
        let pinned = harness.target.clone().with_cert_fingerprint("ab".repeat(32));

        let err = harness
            .client()
            .execute(
                &pinned,
                &ShardRequest::Put {
                    urn: test_urn("acme", 1),
                    value: json!({}),
                },
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Transport(TransportError::PeerMismatch { .. })),
            "{err:?}"
        );
        assert!(harness.store.is_empty());

        // The real fingerprint passes, even with separators and in upper case.
        let actual = fingerprint_file(&harness.server_cert).unwrap();
        let formatted = actual
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).to_ascii_uppercase())
            .collect::<Vec<_>>()
            .join(":");
        let pinned = harness.target.clone().with_cert_fingerprint(formatted);
        harness
            .client()
            .execute(
                &pinned,
                &ShardRequest::Put {
                    urn: test_urn("acme", 1),
                    value: json!({}),
                },
            )
            .await
            .unwrap();
        assert_eq!(harness.store.len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_server_checks_pinned_client_fingerprint() {
        let topology = Arc::new(ShardTopology::new(
            "test",
            Arc::new(InMemoryMetadataStore::new()),
        ));
        let pins = topology.clone();
        let harness = Harness::start_with(move |handler| handler.with_topology(pins)).await;
        let client = harness.client();
        let urn = test_urn("acme", 3);
        let put = ShardRequest::Put {
            urn: urn.clone(),
            value: json!({"n": 3}),
        };

        topology
            .add_shard(
                ShardInfo::new("shard_001", "10.0.0.1:7000").with_cert_fingerprint("cd".repeat(32)),
            )
            .unwrap();
        let err = client.execute(&harness.target, &put).await.unwrap_err();
        assert!(matches!(err, Error::Remote { status: 401, .. }), "{err:?}");
        assert!(harness.store.is_empty());

        let leaf = harness.pki.issue("shard-001.themis.local");
        let client = {
            let config = TransportConfig::default()
                .with_tls(leaf.clone())
                .with_retries(0, Duration::from_millis(1));
            RemoteExecutor::new(
                Arc::new(MtlsTransport::new(&config).unwrap()),
                harness.keys.signer("shard_001"),
                RetryPolicy::from_config(&config),
                Arc::new(ShardingMetrics::new()),
            )
        };
        topology.upsert_shard(
            ShardInfo::new("shard_001", "10.0.0.1:7000")
                .with_cert_fingerprint(fingerprint_file(&leaf.cert_path).unwrap()),
        );
        client.execute(&harness.target, &put).await.unwrap();
        assert_eq!(harness.store.len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_shutdown_closes_listener() {
        let harness = Harness::start().await;
        let client = harness.client();
        client.get(&harness.target, HEALTH_PATH).await.unwrap();

        harness.shutdown.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), harness.server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let err = client.get(&harness.target, HEALTH_PATH).await.unwrap_err();
        assert!(
            matches!(err, Error::Transport(TransportError::RetriesExhausted { .. })),
            "{err:?}"
        );
    }
}
