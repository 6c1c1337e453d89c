//! Error types for the sharding layer.
//!
//! Errors are grouped by where they originate so that callers (and logs and
//! metrics) can tell an unroutable identifier apart from a flaky network
//! link, and both apart from a rejected signature:
//!
//! | Class              | Enum               | Retried?                 |
//! |--------------------|--------------------|--------------------------|
//! | Resolution         | [`ResolutionError`] | no                      |
//! | Transport          | [`TransportError`]  | yes, bounded backoff    |
//! | Authentication     | [`AuthError`]       | never                   |
//! | Migration          | [`MigrationError`]  | per batch only          |
//! | State machine      | [`RebalanceError`]  | no                      |

use crate::types::ShardId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for sharding operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sharding layer.
#[derive(Error, Debug)]
pub enum Error {
    /// An identifier or shard could not be mapped to a known shard.
    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// Connect, handshake or timeout failure talking to a peer.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A signed request or operator action failed authentication.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Data migration failed.
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Illegal rebalance operation or state transition.
    #[error("rebalance error: {0}")]
    Rebalance(#[from] RebalanceError),

    /// Malformed resource name.
    #[error("invalid urn: {0}")]
    Urn(#[from] UrnError),

    /// A peer answered with a non-success status.
    #[error("remote error from {shard_id} (status {status}): {message}")]
    Remote {
        shard_id: ShardId,
        status: u16,
        message: String,
    },

    /// The requested record does not exist on its owning shard.
    #[error("not found: {0}")]
    NotFound(String),

    /// A request could not be understood.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Metadata store failure.
    #[error("metadata store error: {0}")]
    Metadata(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding or decoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised while mapping identifiers to shards.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// The ring has no entries.
    #[error("hash ring is empty")]
    EmptyRing,

    /// No ring entry or topology descriptor matched the identifier.
    #[error("no shard owns {0}")]
    Unroutable(String),

    /// The shard id is not present in the topology.
    #[error("unknown shard: {0}")]
    UnknownShard(ShardId),

    /// The shard id is already registered.
    #[error("shard already exists: {0}")]
    ShardExists(ShardId),

    /// No healthy shard is available to serve the request.
    #[error("no healthy shards available")]
    NoHealthyShards,
}

/// Transport-level failures. These are the only errors that are retried.
#[derive(Error, Debug)]
pub enum TransportError {
    /// TCP connect failed.
    #[error("connection to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// TLS handshake failed.
    #[error("tls handshake with {endpoint} failed: {reason}")]
    HandshakeFailed { endpoint: String, reason: String },

    /// Connect or request deadline exceeded.
    #[error("request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    /// The HTTP exchange failed after the connection was established.
    #[error("request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    /// The endpoint string could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Peer certificate did not match the pinned identity.
    #[error("peer identity mismatch: expected {expected}, got {actual}")]
    PeerMismatch { expected: String, actual: String },

    /// TLS material could not be loaded.
    #[error("tls configuration error: {0}")]
    Tls(String),

    /// Retries exhausted.
    #[error("giving up on {endpoint} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },
}

/// Reasons a signed request or operator action is rejected.
///
/// Each rejection has its own variant so that replay attempts, clock skew and
/// forged signatures are distinguishable in logs and metrics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Timestamp outside the permitted skew window.
    #[error("timestamp skew of {skew_ms}ms exceeds {max_skew_ms}ms")]
    StaleTimestamp { skew_ms: u64, max_skew_ms: u64 },

    /// Nonce already seen within the staleness window.
    #[error("nonce {0} was already used")]
    ReplayedNonce(u64),

    /// Envelope was addressed to a different shard.
    #[error("request for shard {expected} was signed by {actual}")]
    ShardMismatch { expected: ShardId, actual: ShardId },

    /// No certificate is registered under the given serial.
    #[error("unknown certificate serial {0}")]
    UnknownCertificate(String),

    /// The signature does not verify against the canonical string.
    #[error("signature verification failed")]
    InvalidSignature,

    /// The signature field could not be decoded.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// The certificate is on the revocation list.
    #[error("certificate {0} is revoked")]
    RevokedCertificate(String),

    /// The certificate is outside its validity window.
    #[error("certificate {0} is expired or not yet valid")]
    ExpiredCertificate(String),

    /// The signer is not bound to the claimed shard.
    #[error("certificate {serial} is not issued to shard {shard_id}")]
    CertificateShardMismatch { serial: String, shard_id: ShardId },

    /// Operator authorization failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl AuthError {
    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            AuthError::StaleTimestamp { .. } => "stale_timestamp",
            AuthError::ReplayedNonce(_) => "replayed_nonce",
            AuthError::ShardMismatch { .. } => "shard_mismatch",
            AuthError::UnknownCertificate(_) => "unknown_certificate",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::MalformedSignature(_) => "malformed_signature",
            AuthError::RevokedCertificate(_) => "revoked_certificate",
            AuthError::ExpiredCertificate(_) => "expired_certificate",
            AuthError::CertificateShardMismatch { .. } => "certificate_shard_mismatch",
            AuthError::Unauthorized(_) => "unauthorized",
        }
    }
}

/// Data migration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// Too many batch failures.
    #[error("aborted after {errors} batch failures: {last_error}")]
    TooManyErrors { errors: u32, last_error: String },

    /// Post-copy integrity check found different content.
    #[error("integrity check failed: source hash {source_hash} != target hash {target_hash}")]
    IntegrityMismatch {
        source_hash: String,
        target_hash: String,
    },

    /// Fetching from the source shard failed.
    #[error("fetch from {shard_id} failed: {reason}")]
    FetchFailed { shard_id: ShardId, reason: String },

    /// Invalid migration parameters.
    #[error("invalid migration: {0}")]
    Invalid(String),
}

/// Rebalance operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RebalanceError {
    /// Compare-and-swap on the operation state failed.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// No operation with this id.
    #[error("rebalance operation not found: {0}")]
    NotFound(String),

    /// Invalid construction parameters.
    #[error("invalid rebalance operation: {0}")]
    Invalid(String),

    /// Another operation already covers one of the shards.
    #[error("shard {0} is already part of an active rebalance")]
    ShardBusy(ShardId),
}

/// Resource name parse errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrnError {
    #[error("expected 6 colon-separated tokens, got {0}")]
    WrongTokenCount(usize),

    #[error("expected prefix urn:themis")]
    BadPrefix,

    #[error("unknown model {0:?}")]
    InvalidModel(String),

    #[error("malformed uuid {0:?}")]
    InvalidUuid(String),

    #[error("empty {0}")]
    EmptyComponent(&'static str),
}

/// Coarse classification of every error, used for the uniform error shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Resolution,
    Transport,
    Authentication,
    MigrationIntegrity,
    StateMachine,
    Remote,
    NotFound,
    InvalidRequest,
    Timeout,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Resolution => "resolution",
            ErrorKind::Transport => "transport",
            ErrorKind::Authentication => "authentication",
            ErrorKind::MigrationIntegrity => "migration_integrity",
            ErrorKind::StateMachine => "state_machine",
            ErrorKind::Remote => "remote",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Resolution(_) => ErrorKind::Resolution,
            Error::Transport(TransportError::Timeout { .. }) => ErrorKind::Timeout,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Auth(_) => ErrorKind::Authentication,
            Error::Migration(_) => ErrorKind::MigrationIntegrity,
            Error::Rebalance(_) => ErrorKind::StateMachine,
            Error::Urn(_) | Error::BadRequest(_) | Error::Config(_) => ErrorKind::InvalidRequest,
            Error::Remote { .. } => ErrorKind::Remote,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Timeout => ErrorKind::Timeout,
            Error::Metadata(_) | Error::Io(_) | Error::Json(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether a retry may help. Only transport failures qualify; a response
    /// that reached the peer and was rejected is never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(
                TransportError::ConnectFailed { .. }
                    | TransportError::HandshakeFailed { .. }
                    | TransportError::Timeout { .. }
                    | TransportError::RequestFailed { .. }
            )
        )
    }

    /// Whether this is a security rejection.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_))
    }

    /// Convert into the uniform boundary shape.
    pub fn into_shard_error(self, shard_id: impl Into<ShardId>) -> ShardError {
        ShardError::new(shard_id, self.kind(), self.to_string())
    }
}

/// Uniform error shape surfaced at component boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardError {
    pub shard_id: ShardId,
    pub kind: ErrorKind,
    pub message: String,
}

impl ShardError {
    pub fn new(shard_id: impl Into<ShardId>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.shard_id, self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Resolution(ResolutionError::UnknownShard("shard_9".into()));
        assert_eq!(
            err.to_string(),
            "resolution error: unknown shard: shard_9"
        );

        let err = Error::Auth(AuthError::ReplayedNonce(42));
        assert_eq!(
            err.to_string(),
            "authentication error: nonce 42 was already used"
        );
    }

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(
            Error::from(ResolutionError::EmptyRing).kind(),
            ErrorKind::Resolution
        );
        assert_eq!(
            Error::from(TransportError::Timeout {
                endpoint: "a:1".into(),
                timeout_ms: 10
            })
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            Error::from(AuthError::InvalidSignature).kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            Error::from(MigrationError::IntegrityMismatch {
                source_hash: "a".into(),
                target_hash: "b".into()
            })
            .kind(),
            ErrorKind::MigrationIntegrity
        );
        assert_eq!(
            Error::from(RebalanceError::NotFound("x".into())).kind(),
            ErrorKind::StateMachine
        );
    }

    #[test]
    fn test_only_transport_errors_are_retryable() {
        let transport = Error::from(TransportError::ConnectFailed {
            endpoint: "a:1".into(),
            reason: "refused".into(),
        });
        assert!(transport.is_retryable());

        let remote = Error::Remote {
            shard_id: "shard_1".into(),
            status: 500,
            message: "boom".into(),
        };
        assert!(!remote.is_retryable());
        assert!(!Error::from(AuthError::InvalidSignature).is_retryable());
        assert!(!Error::from(TransportError::InvalidEndpoint("x".into())).is_retryable());
    }

    #[test]
    fn test_auth_labels_are_distinct() {
        let labels = [
            AuthError::StaleTimestamp {
                skew_ms: 1,
                max_skew_ms: 0,
            }
            .label(),
            AuthError::ReplayedNonce(1).label(),
            AuthError::InvalidSignature.label(),
            AuthError::RevokedCertificate("1".into()).label(),
            AuthError::UnknownCertificate("1".into()).label(),
        ];
        let unique: std::collections::HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());
    }

    #[test]
    fn test_shard_error_shape() {
        let err = Error::Timeout.into_shard_error("shard_3");
        assert_eq!(err.shard_id, "shard_3");
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.to_string(), "[shard_3] timeout: operation timed out");

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "timeout");
    }
}
