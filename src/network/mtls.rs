//! HTTP/1.1 over mutually authenticated TLS.

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::network::transport::{
    PeerIdentity, SecureTransport, ShardEndpoint, TransportRequest, TransportResponse,
};
use crate::security::tls::{build_client_config, cert_fingerprint};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// [`SecureTransport`] backed by rustls and hyper.
///
/// Each request opens a fresh connection; inter-shard calls are infrequent
/// enough that pooling is not worth the stale-connection handling.
#[derive(Clone)]
pub struct MtlsTransport {
    connector: TlsConnector,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl MtlsTransport {
    /// Load certificates from `config.tls` and build the transport.
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = build_client_config(&config.tls)?;
        Ok(Self::with_client_config(client, config))
    }

    /// Use an already built rustls client configuration.
    pub fn with_client_config(client: Arc<ClientConfig>, config: &TransportConfig) -> Self {
        Self {
            connector: TlsConnector::from(client),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }

    async fn handshake(
        &self,
        endpoint: &ShardEndpoint,
    ) -> Result<(TlsStream<TcpStream>, PeerIdentity), TransportError> {
        let addr = endpoint.authority();
        let timeout_ms = self.connect_timeout.as_millis() as u64;

        let tcp = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host(), endpoint.port())),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            endpoint: addr.clone(),
            timeout_ms,
        })?
        .map_err(|e| TransportError::ConnectFailed {
            endpoint: addr.clone(),
            reason: e.to_string(),
        })?;
        let _ = tcp.set_nodelay(true);

        let server_name = ServerName::try_from(endpoint.host().to_string())
            .map_err(|_| TransportError::InvalidEndpoint(addr.clone()))?;

        let tls = tokio::time::timeout(self.connect_timeout, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: addr.clone(),
                timeout_ms,
            })?
            .map_err(|e| TransportError::HandshakeFailed {
                endpoint: addr.clone(),
                reason: e.to_string(),
            })?;

        let fingerprint = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|leaf| cert_fingerprint(leaf.as_ref()))
            .ok_or_else(|| TransportError::HandshakeFailed {
                endpoint: addr.clone(),
                reason: "peer presented no certificate".into(),
            })?;

        let peer = PeerIdentity::new(endpoint.host(), fingerprint);
        self.verify_peer(endpoint, &peer)?;
        debug!(endpoint = %addr, peer_shard = ?peer.shard_id, "mTLS session established");
        Ok((tls, peer))
    }

    async fn exchange(
        &self,
        endpoint: &ShardEndpoint,
        tls: TlsStream<TcpStream>,
        request: TransportRequest,
    ) -> Result<(u16, Bytes), TransportError> {
        let addr = endpoint.authority();
        let failed = |reason: String| TransportError::RequestFailed {
            endpoint: addr.clone(),
            reason,
        };

        let (mut sender, conn) = http1::handshake(TokioIo::new(tls))
            .await
            .map_err(|e| failed(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Client connection closed with error");
            }
        });

        let mut builder = hyper::Request::builder()
            .method(request.method.as_str())
            .uri(request.path.as_str())
            .header(HOST, addr.as_str())
            .header(CONTENT_TYPE, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let req = builder
            .body(Full::new(request.body))
            .map_err(|e| failed(e.to_string()))?;

        let response = sender
            .send_request(req)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| failed(e.to_string()))?
            .to_bytes();
        Ok((status, body))
    }
}

impl fmt::Debug for MtlsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtlsTransport")
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SecureTransport for MtlsTransport {
    async fn connect(&self, endpoint: &ShardEndpoint) -> Result<PeerIdentity, TransportError> {
        let (_, peer) = self.handshake(endpoint).await?;
        Ok(peer)
    }

    async fn send(
        &self,
        endpoint: &ShardEndpoint,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let (tls, peer) = self.handshake(endpoint).await?;
        let (status, body) = tokio::time::timeout(self.request_timeout, self.exchange(endpoint, tls, request))
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: endpoint.authority(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            })??;
        Ok(TransportResponse { status, body, peer })
    }
}
