//! TLS termination with rustls and SNI support
//!
//! Certificates live in the routing snapshot; the handshake-time resolver
//! reads the current snapshot and picks the certificate for the SNI server
//! name. A missing snapshot or unknown server name aborts the handshake,
//! there is no self-signed fallback.

use rustls::crypto::{ring, CryptoProvider};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::io::{self, BufReader};
use std::sync::Arc;
use tracing::debug;

use crate::proxy::snapshot::SnapshotCell;

/// Parse a PEM certificate chain and private key into rustls signing material.
pub fn parse_certified_key(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey, io::Error> {
    let mut cert_reader = BufReader::new(cert_pem);
    let cert_chain = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if cert_chain.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificate found",
        ));
    }

    let mut key_reader = BufReader::new(key_pem);
    let key = private_key(&mut key_reader)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))?;
    let signing_key = ring::sign::any_supported_type(&key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(CertifiedKey::new(cert_chain, signing_key))
}

/// SNI certificate selection from the current snapshot.
#[derive(Debug)]
pub struct SnapshotCertResolver {
    snapshots: Arc<SnapshotCell>,
}

impl SnapshotCertResolver {
    pub fn new(snapshots: Arc<SnapshotCell>) -> Self {
        Self { snapshots }
    }
}

impl ResolvesServerCert for SnapshotCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let snapshot = self.snapshots.load()?;
        let server_name = client_hello.server_name()?;
        let cert = snapshot.certs.get(server_name).cloned();
        if cert.is_none() {
            debug!(server_name = %server_name, "no certificate for server name");
        }
        cert
    }
}

/// Crypto policy: TLS 1.2 restricted to ECDHE with AES-256-GCM and
/// CHACHA20-POLY1305, key exchange on P-384 then P-256. TLS 1.3 suites stay
/// at provider defaults since they are not negotiable policy knobs.
fn crypto_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![
            ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
            ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            ring::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        kx_groups: vec![ring::kx_group::SECP384R1, ring::kx_group::SECP256R1],
        ..ring::default_provider()
    }
}

/// Server TLS configuration for the HTTPS listener.
///
/// Minimum version TLS 1.2; ALPN advertises h2 and http/1.1, plus h3 when
/// the HTTP/3 front is active.
pub fn server_config(
    snapshots: Arc<SnapshotCell>,
    http3: bool,
) -> Result<ServerConfig, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(crypto_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SnapshotCertResolver::new(snapshots)));
    config.alpn_protocols = if http3 {
        vec![b"h3".to_vec(), b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    };
    Ok(config)
}

/// Server TLS configuration for the QUIC listener: same certificate
/// selection, ALPN restricted to h3.
pub fn h3_server_config(snapshots: Arc<SnapshotCell>) -> Result<ServerConfig, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(crypto_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SnapshotCertResolver::new(snapshots)));
    config.alpn_protocols = vec![b"h3".to_vec()];
    Ok(config)
}
