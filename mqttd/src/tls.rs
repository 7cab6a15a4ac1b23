//! Server TLS configuration.
//!
//! [`build`] turns a certificate chain, a private key and an optional client
//! CA bundle into a rustls [`ServerConfig`] restricted to AEAD cipher suites
//! with ECDHE key exchange.
//!
//! A bad certificate or key is an error. A bad CA bundle only disables client
//! certificate verification.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::crypto::ring::{self, cipher_suite};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use rustls::{RootCertStore, ServerConfig, SupportedCipherSuite};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Cipher suites offered by TLS listeners.
pub fn cipher_suites() -> Vec<SupportedCipherSuite> {
    vec![
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

/// The ring provider narrowed to [`cipher_suites`].
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(CryptoProvider {
        cipher_suites: cipher_suites(),
        ..ring::default_provider()
    })
}

/// Build a server TLS configuration.
///
/// When `ca` names a PEM file holding at least one certificate, clients must
/// present a certificate signed by it. Otherwise no client certificate is
/// requested.
pub fn build(cert: &Path, key: &Path, ca: Option<&Path>) -> Result<Arc<ServerConfig>> {
    let provider = provider();
    let certs = load_certificates(cert)?;
    let key = load_private_key(key)?;

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let config = match ca.and_then(|ca| client_verifier(ca, &provider)) {
        Some(verifier) => builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?,
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };

    info!(cert = %cert.display(), "tls configuration loaded");
    Ok(Arc::new(config))
}

/// Verifier requiring client certificates signed by `ca`, if usable.
fn client_verifier(
    ca: &Path,
    provider: &Arc<CryptoProvider>,
) -> Option<Arc<dyn ClientCertVerifier>> {
    if ca.as_os_str().is_empty() {
        return None;
    }

    let certs = match load_certificates(ca) {
        Ok(certs) => certs,
        Err(e) => {
            warn!(ca = %ca.display(), error = %e, "client CA not loaded, client certificates not required");
            return None;
        }
    };

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    debug!(added, ignored, "client CA certificates");
    if added == 0 {
        warn!(ca = %ca.display(), "client CA holds no usable certificate, client certificates not required");
        return None;
    }

    match WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider)).build() {
        Ok(verifier) => {
            info!(ca = %ca.display(), "client certificates required");
            Some(verifier)
        }
        Err(e) => {
            warn!(ca = %ca.display(), error = %e, "client verifier not built, client certificates not required");
            None
        }
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| Error::CertificateLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::CertificateLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(Error::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| Error::PrivateKeyLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::PrivateKeyLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| Error::NoPrivateKey(path.display().to_string()))
}
