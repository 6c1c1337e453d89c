//! Authentication of inter-shard traffic.
//!
//! Two layers cooperate:
//!
//! - **mTLS** ([`tls`]): both peers present certificates chained to the
//!   cluster CA; rustls checks the chain and the configured CRL.
//! - **Signed envelopes** ([`signing`]): every request body is wrapped in a
//!   [`SignedRequest`] carrying a timestamp, a random nonce and an Ed25519
//!   signature. [`RequestVerifier`] rejects stale, replayed, forged, revoked
//!   or expired envelopes before anything reaches a handler.
//!
//! ```text
//!   sender                                  receiver
//!   ──────                                  ────────
//!   RequestSigner::sign ──► TLS ──► RequestVerifier::verify
//!                                      │ 1. timestamp within skew
//!                                      │ 2. nonce not seen
//!                                      │ 3. addressed to this shard
//!                                      │ 4. signature vs cert_serial key
//!                                      │ 5. certificate not revoked
//!                                      │ 6. certificate not expired
//!                                      ▼
//!                                   handler
//! ```

mod certificate;
mod nonce;
mod signing;
pub mod tls;

pub use certificate::{
    shard_id_from_common_name, CertificateRegistry, CertificateStatus, ShardCertificate,
};
pub use nonce::NonceCache;
pub use signing::{RequestSigner, RequestVerifier, SignedRequest, VerifierConfig};
