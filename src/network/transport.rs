//! Transport abstraction for inter-shard calls.
//!
//! The router and the signing layer only see [`SecureTransport`]; the TLS
//! library lives behind [`MtlsTransport`](super::MtlsTransport).

use crate::config::DEFAULT_PORT;
use crate::error::TransportError;
use crate::security::shard_id_from_common_name;
use crate::topology::ShardInfo;
use crate::types::ShardId;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Header carrying the client-generated idempotency key.
pub const REQUEST_ID_HEADER: &str = "x-themis-request-id";

/// A parsed `host:port` peer address plus the identity it must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardEndpoint {
    host: String,
    port: u16,
    expected_shard: Option<ShardId>,
    fingerprint: Option<String>,
}

impl ShardEndpoint {
    /// Parse `[scheme://]host[:port][/...]`.
    ///
    /// The port is split off at the last `:` so bracketed IPv6 hosts keep
    /// their colons; a missing port defaults to 8080.
    pub fn parse(endpoint: &str) -> Result<Self, TransportError> {
        let trimmed = endpoint.trim();
        let without_scheme = trimmed
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(trimmed);
        let authority = without_scheme.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
        }

        let (host, port) = match authority.rfind(':') {
            Some(idx) if !authority[idx..].contains(']') => {
                let port = authority[idx + 1..]
                    .parse::<u16>()
                    .map_err(|_| TransportError::InvalidEndpoint(endpoint.to_string()))?;
                (&authority[..idx], port)
            }
            _ => (authority, DEFAULT_PORT),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            expected_shard: None,
            fingerprint: None,
        })
    }

    /// Endpoint of a shard descriptor, pinned to that shard's identity.
    pub fn for_shard(shard: &ShardInfo) -> Result<Self, TransportError> {
        let mut endpoint = Self::parse(&shard.primary_endpoint)?;
        endpoint.expected_shard = Some(shard.shard_id.clone());
        endpoint.fingerprint = shard.cert_fingerprint.clone();
        Ok(endpoint)
    }

    /// Require the peer certificate to hash to `fingerprint`.
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Require the peer's verified name to map to `shard_id`.
    pub fn with_expected_shard(mut self, shard_id: impl Into<ShardId>) -> Self {
        self.expected_shard = Some(shard_id.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn expected_shard(&self) -> Option<&str> {
        self.expected_shard.as_deref()
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `https://host:port`.
    pub fn base_url(&self) -> String {
        format!("https://{}", self.authority())
    }
}

impl fmt::Display for ShardEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Identity established by a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Name the peer certificate was verified against.
    pub server_name: String,

    /// SHA-256 of the peer leaf certificate.
    pub fingerprint: String,

    /// Shard id derived from the verified name, when it follows the
    /// `shard-NNN.<cluster>` convention.
    pub shard_id: Option<ShardId>,
}

impl PeerIdentity {
    pub fn new(server_name: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        let server_name = server_name.into();
        let shard_id = shard_id_from_common_name(&server_name);
        Self {
            server_name,
            fingerprint: fingerprint.into(),
            shard_id,
        }
    }
}

/// One HTTP exchange.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl TransportRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw answer from a peer.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
    pub peer: PeerIdentity,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Mutually authenticated request/response channel to peer shards.
///
/// `send` performs a single attempt; retry policy belongs to the caller.
#[async_trait]
pub trait SecureTransport: Send + Sync + fmt::Debug {
    /// Open a session and return the peer identity without sending a request.
    async fn connect(&self, endpoint: &ShardEndpoint) -> Result<PeerIdentity, TransportError>;

    /// Send one request and wait for the full response.
    async fn send(
        &self,
        endpoint: &ShardEndpoint,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError>;

    /// Check a handshake result against the endpoint's pinned identity.
    fn verify_peer(
        &self,
        endpoint: &ShardEndpoint,
        peer: &PeerIdentity,
    ) -> Result<(), TransportError> {
        if let Some(pinned) = endpoint.fingerprint() {
            let pinned = normalize_fingerprint(pinned);
            if pinned != peer.fingerprint {
                return Err(TransportError::PeerMismatch {
                    expected: pinned,
                    actual: peer.fingerprint.clone(),
                });
            }
        }
        // Only names following the shard naming convention carry an identity.
        if let (Some(expected), Some(actual)) = (endpoint.expected_shard(), &peer.shard_id) {
            if expected != actual {
                return Err(TransportError::PeerMismatch {
                    expected: expected.to_string(),
                    actual: actual.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Lowercase hex without `:` separators.
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NullTransport;

    #[async_trait]
    impl SecureTransport for NullTransport {
        async fn connect(&self, _: &ShardEndpoint) -> Result<PeerIdentity, TransportError> {
            Err(TransportError::ConnectFailed {
                endpoint: "null".into(),
                reason: "unused".into(),
            })
        }

        async fn send(
            &self,
            _: &ShardEndpoint,
            _: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            Err(TransportError::ConnectFailed {
                endpoint: "null".into(),
                reason: "unused".into(),
            })
        }
    }

    #[test]
    fn test_parse_endpoint_forms() {
        let e = ShardEndpoint::parse("shard-001.themis.local:9443").unwrap();
        assert_eq!((e.host(), e.port()), ("shard-001.themis.local", 9443));

        let e = ShardEndpoint::parse("https://10.0.0.5:8443/api/v1").unwrap();
        assert_eq!((e.host(), e.port()), ("10.0.0.5", 8443));

        let e = ShardEndpoint::parse("db-node").unwrap();
        assert_eq!(e.port(), DEFAULT_PORT);
        assert_eq!(e.base_url(), "https://db-node:8080");

        let e = ShardEndpoint::parse("[::1]:7000").unwrap();
        assert_eq!((e.host(), e.port()), ("::1", 7000));
        assert_eq!(e.authority(), "[::1]:7000");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ShardEndpoint::parse("").is_err());
        assert!(ShardEndpoint::parse("https://").is_err());
        assert!(ShardEndpoint::parse("host:notaport").is_err());
        assert!(ShardEndpoint::parse(":80").is_err());
    }

    #[test]
    fn test_for_shard_pins_identity() {
        let shard = ShardInfo::new("shard_001", "shard-001.themis.local:9443")
            .with_cert_fingerprint("AB:CD");
        let endpoint = ShardEndpoint::for_shard(&shard).unwrap();
        assert_eq!(endpoint.expected_shard(), Some("shard_001"));
        assert_eq!(endpoint.fingerprint(), Some("AB:CD"));
    }

    #[test]
    fn test_verify_peer() {
        let transport = NullTransport;
        let endpoint = ShardEndpoint::parse("shard-001.themis.local:9443")
            .unwrap()
            .with_expected_shard("shard_001")
            .with_fingerprint("AB:cd:01");

        let good = PeerIdentity::new("shard-001.themis.local", "abcd01");
        assert_eq!(good.shard_id.as_deref(), Some("shard_001"));
        assert!(transport.verify_peer(&endpoint, &good).is_ok());

        let wrong_cert = PeerIdentity::new("shard-001.themis.local", "ffff");
        assert!(matches!(
            transport.verify_peer(&endpoint, &wrong_cert),
            Err(TransportError::PeerMismatch { .. })
        ));

        let unpinned = ShardEndpoint::parse("shard-002.themis.local")
            .unwrap()
            .with_expected_shard("shard_001");
        let other = PeerIdentity::new("shard-002.themis.local", "00");
        assert!(transport.verify_peer(&unpinned, &other).is_err());

        // Names outside the convention fall back to fingerprint pinning only.
        let ip = PeerIdentity::new("127.0.0.1", "00");
        assert!(transport.verify_peer(&unpinned, &ip).is_ok());
    }

    #[test]
    fn test_request_headers_case_insensitive() {
        let req = TransportRequest::new("GET", "/x", Bytes::new()).with_header("X-Themis-Request-Id", "abc");
        assert_eq!(req.header(REQUEST_ID_HEADER), Some("abc"));
        assert!(req.header("missing").is_none());
    }
}
