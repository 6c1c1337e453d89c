//! Shard signing certificates and revocation.
//!
//! A [`ShardCertificate`] binds a certificate serial to a shard identity and
//! the Ed25519 key that shard signs request envelopes with. The
//! [`CertificateRegistry`] is the trust store consulted by the request
//! verifier, the operator authorizer and the health checker.

use crate::error::{AuthError, Error, Result};
use crate::types::{now_millis, ShardId};
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine as _;
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Identity and signing key of one shard certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCertificate {
    /// Serial number (hex).
    pub serial_number: String,

    /// Subject common name, e.g. `shard-001.themis.local`.
    pub subject_cn: String,

    /// Issuer common name.
    #[serde(default)]
    pub issuer_cn: String,

    /// Shard this certificate was issued to.
    pub shard_id: ShardId,

    /// Validity start, ms since epoch.
    pub not_before_ms: u64,

    /// Validity end, ms since epoch.
    pub not_after_ms: u64,

    /// Granted capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// `primary` or `replica`.
    #[serde(default)]
    pub role: String,

    /// Ed25519 verifying key, base64 encoded on the wire.
    #[serde(with = "verifying_key_b64")]
    pub public_key: VerifyingKey,
}

impl ShardCertificate {
    /// Create a certificate valid from now for `validity_days` days.
    pub fn new(
        serial_number: impl Into<String>,
        shard_id: impl Into<ShardId>,
        public_key: VerifyingKey,
        validity_days: u64,
    ) -> Self {
        let shard_id = shard_id.into();
        let now = now_millis();
        Self {
            serial_number: serial_number.into(),
            subject_cn: format!("{}.themis.local", shard_id.replace('_', "-")),
            issuer_cn: String::new(),
            shard_id,
            not_before_ms: now,
            not_after_ms: now + validity_days * MS_PER_DAY,
            capabilities: vec!["read".to_string(), "write".to_string()],
            role: "primary".to_string(),
            public_key,
        }
    }

    /// Parse the verifying key from an SPKI PEM document.
    pub fn public_key_from_pem(pem: &str) -> Result<VerifyingKey> {
        VerifyingKey::from_public_key_pem(pem)
            .map_err(|e| Error::Config(format!("invalid ed25519 public key: {}", e)))
    }

    /// Set the validity window explicitly.
    pub fn with_validity(mut self, not_before_ms: u64, not_after_ms: u64) -> Self {
        self.not_before_ms = not_before_ms;
        self.not_after_ms = not_after_ms;
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

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }

    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms >= self.not_before_ms && now_ms <= self.not_after_ms
    }

    pub fn is_valid_now(&self) -> bool {
        self.is_valid_at(now_millis())
    }

    /// Whole days until expiry; negative once expired.
    pub fn days_until_expiry(&self, now_ms: u64) -> i64 {
        (self.not_after_ms as i64 - now_ms as i64) / MS_PER_DAY as i64
    }

    /// Check the certificate is usable for shard traffic.
    pub fn validate_for_shard(&self, now_ms: u64) -> std::result::Result<(), AuthError> {
        if !self.is_valid_at(now_ms) {
            return Err(AuthError::ExpiredCertificate(self.serial_number.clone()));
        }
        if self.shard_id.is_empty() || self.capabilities.is_empty() {
            return Err(AuthError::Unauthorized(format!(
                "certificate {} lacks shard identity or capabilities",
                self.serial_number
            )));
        }
        Ok(())
    }
}

/// Derive a shard id from a certificate common name.
///
/// `shard-001.themis.local` becomes `shard_001`. Names whose first label
/// does not start with `shard` yield `None`.
pub fn shard_id_from_common_name(cn: &str) -> Option<ShardId> {
    let label = cn.split('.').next()?;
    if !label.starts_with("shard") || label.len() <= "shard".len() {
        return None;
    }
    Some(label.replace('-', "_"))
}

mod verifying_key_b64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &VerifyingKey, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&Base64.encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<VerifyingKey, D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = Base64
            .decode(encoded.trim())
            .map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("ed25519 public key must be 32 bytes"))?;
        VerifyingKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Result of checking one shard's certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateStatus {
    pub serial_number: String,
    pub valid: bool,
    pub revoked: bool,
    pub days_until_expiry: i64,
}

/// Trust store of shard certificates plus a serial revocation list.
#[derive(Debug, Default)]
pub struct CertificateRegistry {
    certificates: RwLock<HashMap<String, ShardCertificate>>,
    revoked: RwLock<HashSet<String>>,
}

impl CertificateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load certificates from a JSON array file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        let certs: Vec<ShardCertificate> = serde_json::from_slice(&raw)?;
        let registry = Self::new();
        for cert in certs {
            registry.register(cert);
        }
        Ok(registry)
    }

    /// Add or replace a certificate.
    pub fn register(&self, cert: ShardCertificate) {
        info!(serial = %cert.serial_number, shard_id = %cert.shard_id, "Registered shard certificate");
        self.certificates
            .write()
            .insert(normalize_serial(&cert.serial_number), cert);
    }

    pub fn remove(&self, serial: &str) -> Option<ShardCertificate> {
        self.certificates.write().remove(&normalize_serial(serial))
    }

    pub fn get(&self, serial: &str) -> Option<ShardCertificate> {
        self.certificates.read().get(&normalize_serial(serial)).cloned()
    }

    /// Newest certificate issued to a shard.
    pub fn find_by_shard(&self, shard_id: &str) -> Option<ShardCertificate> {
        self.certificates
            .read()
            .values()
            .filter(|c| c.shard_id == shard_id)
            .max_by_key(|c| c.not_after_ms)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.certificates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.read().is_empty()
    }

    /// Add a serial to the revocation list.
    pub fn revoke(&self, serial: &str) {
        warn!(serial, "Certificate revoked");
        self.revoked.write().insert(normalize_serial(serial));
    }

    pub fn is_revoked(&self, serial: &str) -> bool {
        self.revoked.read().contains(&normalize_serial(serial))
    }

    /// Load a revocation list: one hex serial per line, `#` starts a comment.
    ///
    /// Returns the number of serials added.
    pub fn load_revocation_list(&self, path: impl AsRef<Path>) -> Result<usize> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut revoked = self.revoked.write();
        let before = revoked.len();
        for line in raw.lines() {
            let serial = line.split('#').next().unwrap_or("").trim();
            if !serial.is_empty() {
                revoked.insert(normalize_serial(serial));
            }
        }
        Ok(revoked.len() - before)
    }

    /// Validity summary of a certificate; `None` if the serial is unknown.
    pub fn status(&self, serial: &str, now_ms: u64) -> Option<CertificateStatus> {
        let cert = self.get(serial)?;
        let revoked = self.is_revoked(serial);
        Some(CertificateStatus {
            serial_number: cert.serial_number.clone(),
            valid: cert.is_valid_at(now_ms) && !revoked,
            revoked,
            days_until_expiry: cert.days_until_expiry(now_ms),
        })
    }
}

/// Serials compare case-insensitively and ignore `:` separators.
fn normalize_serial(serial: &str) -> String {
    serial
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
