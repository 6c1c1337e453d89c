//! Throwaway key material for tests.

use crate::config::TlsConfig;
use crate::security::{CertificateRegistry, RequestSigner, ShardCertificate};
use crate::types::ShardId;
use ed25519_dalek::SigningKey;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer,
    KeyPair,
};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

/// A cluster CA whose files live in a temporary directory.
///
/// Every issued leaf is valid for both server and client authentication and
/// carries `localhost` and `127.0.0.1` next to its own name.
pub struct TestPki {
    dir: TempDir,
    issuer: Issuer<'static, KeyPair>,
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    name
}

impl TestPki {
    pub fn new() -> Self {
        let dir = tempfile::Builder::new()
            .prefix("themis-pki")
            .tempdir()
            .unwrap();
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = distinguished_name("themis test ca");
        let ca_cert = params.self_signed(&key).unwrap();
        let issuer = Issuer::new(params, key);
        std::fs::write(dir.path().join("ca.pem"), ca_cert.pem()).unwrap();
        Self { dir, issuer }
    }

    /// Issue a leaf for `name` and return the paths to use it.
    pub fn issue(&self, name: &str) -> TlsConfig {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![
            name.to_string(),
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();
        params.distinguished_name = distinguished_name(name);
        params.is_ca = IsCa::NoCa;
        let cert = params.signed_by(&key, &self.issuer).unwrap();

        let cert_path = self.dir.path().join(format!("{}.pem", name));
        let key_path = self.dir.path().join(format!("{}.key", name));
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();
        TlsConfig::new(cert_path, key_path, self.dir.path().join("ca.pem"))
    }
}

/// Ed25519 signing keys for a set of shards, registered in one registry.
///
/// Serials are random per instance, so keys from another `TestKeys` are
/// unknown to this registry.
pub struct TestKeys {
    registry: Arc<CertificateRegistry>,
    keys: HashMap<ShardId, (String, SigningKey)>,
}

impl TestKeys {
    pub fn new(shard_ids: &[&str]) -> Self {
        let registry = Arc::new(CertificateRegistry::new());
        let batch: u32 = rand::random();
        let mut keys = HashMap::new();
        for (i, shard_id) in shard_ids.iter().enumerate() {
            let key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
            let serial = format!("{:08x}{:04x}", batch, i);
            registry.register(ShardCertificate::new(
                serial.clone(),
                *shard_id,
                key.verifying_key(),
                365,
            ));
            keys.insert(shard_id.to_string(), (serial, key));
        }
        Self { registry, keys }
    }

    pub fn registry(&self) -> Arc<CertificateRegistry> {
        self.registry.clone()
    }

    pub fn serial(&self, shard_id: &str) -> &str {
        &self.keys[shard_id].0
    }

    pub fn signer(&self, shard_id: &str) -> RequestSigner {
        let (serial, key) = &self.keys[shard_id];
        RequestSigner::new(shard_id, serial.clone(), key.clone())
    }
}
