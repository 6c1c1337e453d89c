//! Signed, replay-protected request envelopes.
//!
//! ```text
//!  caller                                         receiver
//!  ──────                                         ────────
//!  SignedRequest { shard_id, operation, path,
//!                  body, timestamp_ms, nonce }
//!        │ canonical = "shard_id|operation|path|body|timestamp_ms|nonce"
//!        │ signature = ed25519(canonical)
//!        ▼
//!  ─────────────── HTTP over mTLS ───────────────►  1. |now - ts| <= max skew
//!                                                   2. nonce not seen
//!                                                   3. addressed shard matches
//!                                                   4. signature verifies for cert_serial
//!                                                   5. cert not revoked
//!                                                   6. cert valid and issued to shard_id
//!                                                   7. record nonce
//! ```

use crate::error::AuthError;
use crate::security::certificate::CertificateRegistry;
use crate::security::nonce::NonceCache;
use crate::types::{now_millis, ShardId};
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine as _;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signature, Signer, SigningKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Inter-shard request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedRequest {
    /// Claimed sender.
    pub shard_id: ShardId,

    /// HTTP method, e.g. `GET`.
    pub operation: String,

    /// Request path, e.g. `/api/v1/data/urn:...`.
    pub path: String,

    /// JSON body; `null` when absent.
    #[serde(default)]
    pub body: Value,

    pub timestamp_ms: u64,

    /// Random per-request value.
    pub nonce: u64,

    /// Base64 Ed25519 signature over [`canonical_string`](Self::canonical_string).
    pub signature: String,

    /// Serial of the certificate whose key produced `signature`.
    pub cert_serial: String,
}

impl SignedRequest {
    /// `shard_id|operation|path|body-as-json|timestamp_ms|nonce`.
    ///
    /// Object keys serialise in sorted order, so the string is stable across
    /// a JSON round trip.
    pub fn canonical_string(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.shard_id, self.operation, self.path, self.body, self.timestamp_ms, self.nonce
        )
    }
}

// ============================================================================
// Signer
// ============================================================================

/// Signs outbound envelopes with this shard's key.
#[derive(Clone)]
pub struct RequestSigner {
    shard_id: ShardId,
    cert_serial: String,
    key: Arc<SigningKey>,
}

impl RequestSigner {
    pub fn new(shard_id: impl Into<ShardId>, cert_serial: impl Into<String>, key: SigningKey) -> Self {
        Self {
            shard_id: shard_id.into(),
            cert_serial: cert_serial.into(),
            key: Arc::new(key),
        }
    }

    /// Load a PKCS#8 PEM Ed25519 key.
    pub fn from_pem_file(
        shard_id: impl Into<ShardId>,
        cert_serial: impl Into<String>,
        key_path: impl AsRef<Path>,
    ) -> crate::Result<Self> {
        let pem = std::fs::read_to_string(key_path.as_ref())?;
        let key = SigningKey::from_pkcs8_pem(&pem)
            .map_err(|e| crate::Error::Config(format!("invalid ed25519 signing key: {}", e)))?;
        Ok(Self::new(shard_id, cert_serial, key))
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn cert_serial(&self) -> &str {
        &self.cert_serial
    }

    /// Build and sign an envelope stamped with the current time and a fresh nonce.
    pub fn sign(&self, operation: &str, path: &str, body: Value) -> SignedRequest {
        self.sign_at(operation, path, body, now_millis(), rand::random())
    }

    /// Build and sign an envelope with explicit timestamp and nonce.
    pub fn sign_at(
        &self,
        operation: &str,
        path: &str,
        body: Value,
        timestamp_ms: u64,
        nonce: u64,
    ) -> SignedRequest {
        let mut request = SignedRequest {
            shard_id: self.shard_id.clone(),
            operation: operation.to_string(),
            path: path.to_string(),
            body,
            timestamp_ms,
            nonce,
            signature: String::new(),
            cert_serial: self.cert_serial.clone(),
        };
        request.signature = self.sign_bytes(request.canonical_string().as_bytes());
        request
    }

    /// Base64 signature over arbitrary bytes.
    pub fn sign_bytes(&self, message: &[u8]) -> String {
        let signature: Signature = self.key.sign(message);
        Base64.encode(signature.to_bytes())
    }
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner")
            .field("shard_id", &self.shard_id)
            .field("cert_serial", &self.cert_serial)
            .field("key", &"[redacted]")
            .finish()
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Verifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Maximum accepted distance between envelope timestamp and local clock.
    pub max_time_skew_ms: u64,

    /// How long a seen nonce is remembered.
    pub nonce_expiry_ms: u64,

    /// Upper bound on remembered nonces.
    pub max_nonce_cache: usize,

    /// Reject certificates outside their validity window.
    pub check_certificate_validity: bool,

    /// Require the certificate to be issued to the envelope's shard id.
    pub require_shard_binding: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_time_skew_ms: 60_000,
            nonce_expiry_ms: 300_000,
            max_nonce_cache: 10_000,
            check_certificate_validity: true,
            require_shard_binding: true,
        }
    }
}

impl VerifierConfig {
    pub fn with_max_time_skew_ms(mut self, ms: u64) -> Self {
        self.max_time_skew_ms = ms;
        self
    }

    pub fn with_nonce_cache(mut self, max_entries: usize, expiry_ms: u64) -> Self {
        self.max_nonce_cache = max_entries;
        self.nonce_expiry_ms = expiry_ms;
        self
    }
}

/// Verifies inbound envelopes. Shared across all inbound connections.
#[derive(Debug)]
pub struct RequestVerifier {
    config: VerifierConfig,
    certificates: Arc<CertificateRegistry>,
    nonces: NonceCache,
}

impl RequestVerifier {
    pub fn new(config: VerifierConfig, certificates: Arc<CertificateRegistry>) -> Self {
        let nonces = NonceCache::new(config.max_nonce_cache, config.nonce_expiry_ms);
        Self {
            config,
            certificates,
            nonces,
        }
    }

    /// Verify against the local clock.
    ///
    /// `expected_shard` restricts the accepted sender when set.
    pub fn verify(
        &self,
        request: &SignedRequest,
        expected_shard: Option<&str>,
    ) -> Result<(), AuthError> {
        self.verify_at(request, expected_shard, now_millis())
    }

    /// Verify against an explicit clock reading.
    pub fn verify_at(
        &self,
        request: &SignedRequest,
        expected_shard: Option<&str>,
        now_ms: u64,
    ) -> Result<(), AuthError> {
        let result = self.check(request, expected_shard, now_ms);
        match &result {
            Ok(()) => debug!(shard_id = %request.shard_id, nonce = request.nonce, "Verified signed request"),
            Err(e) => warn!(
                shard_id = %request.shard_id,
                cert_serial = %request.cert_serial,
                reason = e.label(),
                "Rejected signed request"
            ),
        }
        result
    }

    fn check(
        &self,
        request: &SignedRequest,
        expected_shard: Option<&str>,
        now_ms: u64,
    ) -> Result<(), AuthError> {
        let skew_ms = now_ms.abs_diff(request.timestamp_ms);
        if skew_ms > self.config.max_time_skew_ms {
            return Err(AuthError::StaleTimestamp {
                skew_ms,
                max_skew_ms: self.config.max_time_skew_ms,
            });
        }

        if self.nonces.contains(request.nonce) {
            return Err(AuthError::ReplayedNonce(request.nonce));
        }

        if let Some(expected) = expected_shard.filter(|s| !s.is_empty()) {
            if request.shard_id != expected {
                return Err(AuthError::ShardMismatch {
                    expected: expected.to_string(),
                    actual: request.shard_id.clone(),
                });
            }
        }

        let cert = self
            .certificates
            .get(&request.cert_serial)
            .ok_or_else(|| AuthError::UnknownCertificate(request.cert_serial.clone()))?;

        let raw = Base64
            .decode(request.signature.as_bytes())
            .map_err(|e| AuthError::MalformedSignature(e.to_string()))?;
        let signature = Signature::from_slice(&raw)
            .map_err(|e| AuthError::MalformedSignature(e.to_string()))?;
        cert.public_key
            .verify_strict(request.canonical_string().as_bytes(), &signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        if self.certificates.is_revoked(&request.cert_serial) {
            return Err(AuthError::RevokedCertificate(request.cert_serial.clone()));
        }

        if self.config.check_certificate_validity && !cert.is_valid_at(now_ms) {
            return Err(AuthError::ExpiredCertificate(request.cert_serial.clone()));
        }

        if self.config.require_shard_binding && cert.shard_id != request.shard_id {
            return Err(AuthError::CertificateShardMismatch {
                serial: cert.serial_number,
                shard_id: request.shard_id.clone(),
            });
        }

        // Check-and-insert closes the race between two concurrent copies.
        if !self.nonces.insert(request.nonce, now_ms) {
            return Err(AuthError::ReplayedNonce(request.nonce));
        }

        Ok(())
    }

    /// Drop expired nonces.
    pub fn prune_nonces(&self) -> usize {
        self.nonces.prune(now_millis())
    }

    pub fn nonce_cache_len(&self) -> usize {
        self.nonces.len()
    }

    pub fn certificates(&self) -> &Arc<CertificateRegistry> {
        &self.certificates
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }
}
