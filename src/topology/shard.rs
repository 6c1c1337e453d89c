//! Shard descriptors.

use crate::types::{ShardId, Token};
use serde::{Deserialize, Serialize};

/// Capability allowing reads.
pub const CAP_READ: &str = "read";
/// Capability allowing writes.
pub const CAP_WRITE: &str = "write";
/// Capability allowing replication traffic.
pub const CAP_REPLICATE: &str = "replicate";
/// Capability allowing administrative actions such as rebalancing.
pub const CAP_ADMIN: &str = "admin";

/// Metadata describing one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Unique shard id, e.g. `shard_001`.
    pub shard_id: ShardId,

    /// `host:port` (optionally with scheme) of the primary.
    pub primary_endpoint: String,

    /// Replica endpoints.
    #[serde(default)]
    pub replica_endpoints: Vec<String>,

    /// Datacenter, e.g. `dc1`.
    #[serde(default)]
    pub datacenter: String,

    /// Rack, for locality-aware placement.
    #[serde(default)]
    pub rack: String,

    /// Start of the shard's token span.
    #[serde(default)]
    pub token_start: Token,

    /// End of the shard's token span.
    #[serde(default)]
    pub token_end: Token,

    /// Last reported health.
    #[serde(default = "default_healthy")]
    pub is_healthy: bool,

    /// Serial of the certificate this shard signs requests with.
    #[serde(default)]
    pub certificate_serial: String,

    /// Optional SHA-256 fingerprint (hex) of the shard's TLS leaf certificate.
    #[serde(default)]
    pub cert_fingerprint: Option<String>,

    /// Granted capabilities (`read`, `write`, `replicate`, `admin`).
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Whether the shard holds virtual nodes on the ring. A staged shard is
    /// known to the topology but owns no tokens until a rebalance cuts it over.
    #[serde(default = "default_on_ring")]
    pub on_ring: bool,

    /// Virtual node count the shard joined the ring with; `None` means the
    /// ring's configured default.
    #[serde(default)]
    pub virtual_nodes: Option<usize>,
}

fn default_healthy() -> bool {
    true
}

fn default_on_ring() -> bool {
    true
}

impl ShardInfo {
    /// Create a healthy shard with read/write capabilities.
    pub fn new(shard_id: impl Into<ShardId>, primary_endpoint: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            primary_endpoint: primary_endpoint.into(),
            replica_endpoints: Vec::new(),
            datacenter: String::new(),
            rack: String::new(),
            token_start: 0,
            token_end: 0,
            is_healthy: true,
            certificate_serial: String::new(),
            cert_fingerprint: None,
            capabilities: vec![CAP_READ.to_string(), CAP_WRITE.to_string()],
            on_ring: true,
            virtual_nodes: None,
        }
    }

    /// Keep the shard off the ring.
    pub fn staged(mut self) -> Self {
        self.on_ring = false;
        self
    }

    /// Join the ring with `virtual_nodes` tokens.
    pub fn with_virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.on_ring = true;
        self.virtual_nodes = Some(virtual_nodes);
        self
    }

    /// Set datacenter and rack.
    pub fn with_location(mut self, datacenter: impl Into<String>, rack: impl Into<String>) -> Self {
        self.datacenter = datacenter.into();
        self.rack = rack.into();
        self
    }

    /// Set the signing certificate serial.
    pub fn with_certificate_serial(mut self, serial: impl Into<String>) -> Self {
        self.certificate_serial = serial.into();
        self
    }

    /// Pin the TLS leaf certificate fingerprint.
    pub fn with_cert_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.cert_fingerprint = Some(fingerprint.into());
        self
    }

    /// Replace the capability list.
    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Add a replica endpoint.
    pub fn with_replica(mut self, endpoint: impl Into<String>) -> Self {
        self.replica_endpoints.push(endpoint.into());
        self
    }

    /// Set the token span.
    pub fn with_token_span(mut self, start: Token, end: Token) -> Self {
        self.token_start = start;
        self.token_end = end;
        self
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_capabilities() {
        let shard = ShardInfo::new("shard_001", "10.0.0.1:8080")
            .with_location("dc1", "rack01")
            .with_capabilities([CAP_READ, CAP_ADMIN])
            .with_replica("10.0.0.2:8080");

        assert!(shard.is_healthy);
        assert!(shard.has_capability(CAP_ADMIN));
        assert!(!shard.has_capability(CAP_WRITE));
        assert_eq!(shard.datacenter, "dc1");
        assert_eq!(shard.replica_endpoints.len(), 1);
    }

    #[test]
    fn test_deserialize_minimal_descriptor() {
        let shard: ShardInfo = serde_json::from_str(
            r#"{"shard_id":"shard_002","primary_endpoint":"h:1"}"#,
        )
        .unwrap();
        assert!(shard.is_healthy);
        assert!(shard.capabilities.is_empty());
        assert_eq!(shard.cert_fingerprint, None);
        assert!(shard.on_ring);
        assert_eq!(shard.virtual_nodes, None);
    }

    #[test]
    fn test_ring_membership_survives_serialization() {
        let staged = ShardInfo::new("shard_003", "h:1").staged();
        let json = serde_json::to_string(&staged).unwrap();
        let back: ShardInfo = serde_json::from_str(&json).unwrap();
        assert!(!back.on_ring);

        let joined = staged.with_virtual_nodes(64);
        assert!(joined.on_ring);
        assert_eq!(joined.virtual_nodes, Some(64));
    }
}
