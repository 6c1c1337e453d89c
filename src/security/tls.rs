//! rustls configuration for mutually authenticated shard traffic.
//!
//! Both directions verify the peer chain against the cluster CA and,
//! when configured, a PEM certificate revocation list.

use crate::config::TlsConfig;
use crate::error::TransportError;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

type TlsResult<T> = std::result::Result<T, TransportError>;

fn tls_err(context: &str, path: &Path, e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(format!("{} {}: {}", context, path.display(), e))
}

/// Load every certificate in a PEM file.
pub fn load_certs(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).map_err(|e| tls_err("failed to read", path, e))?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err("invalid PEM in", path, e))?;
    if certs.is_empty() {
        return Err(tls_err("no certificates found in", path, "empty"));
    }
    Ok(certs)
}

/// Load the first private key in a PEM file.
pub fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).map_err(|e| tls_err("failed to read", path, e))?;
    PrivateKeyDer::from_pem_slice(&pem).map_err(|e| tls_err("invalid private key in", path, e))
}

/// Build a root store from a PEM CA bundle.
pub fn load_root_store(path: &Path) -> TlsResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| tls_err("invalid CA certificate in", path, e))?;
    }
    Ok(roots)
}

/// Load PEM CRLs, or none when no path is configured.
pub fn load_crls(path: Option<&Path>) -> TlsResult<Vec<CertificateRevocationListDer<'static>>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let pem = std::fs::read(path).map_err(|e| tls_err("failed to read", path, e))?;
    CertificateRevocationListDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err("invalid CRL in", path, e))
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Client side: present our certificate, verify the server against the CA.
pub fn build_client_config(config: &TlsConfig) -> TlsResult<Arc<ClientConfig>> {
    let roots = Arc::new(load_root_store(&config.ca_cert_path)?);
    let crls = load_crls(config.crl_path.as_deref())?;
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let verifier = WebPkiServerVerifier::builder_with_provider(roots, provider())
        .with_crls(crls)
        .build()
        .map_err(|e| TransportError::Tls(format!("failed to build server verifier: {}", e)))?;

    let client = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_webpki_verifier(verifier)
        .with_client_auth_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("invalid client certificate: {}", e)))?;

    Ok(Arc::new(client))
}

/// Server side: require a client certificate chained to the CA.
pub fn build_server_config(config: &TlsConfig) -> TlsResult<Arc<ServerConfig>> {
    let roots = Arc::new(load_root_store(&config.ca_cert_path)?);
    let crls = load_crls(config.crl_path.as_deref())?;
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
        .with_crls(crls)
        .build()
        .map_err(|e| TransportError::Tls(format!("failed to build client verifier: {}", e)))?;

    let server = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("invalid server certificate: {}", e)))?;

    Ok(Arc::new(server))
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn cert_fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Fingerprint of the first certificate in a PEM file.
pub fn fingerprint_file(path: &Path) -> TlsResult<String> {
    let certs = load_certs(path)?;
    Ok(cert_fingerprint(certs[0].as_ref()))
}
