//! Self-signed ECC certificate for the TLS listeners.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use tracing::warn;

pub const CERT_FILE: &str = "cert.ec.pem";
pub const KEY_FILE: &str = "cert-key.ec.pem";

/// Generate a P-256 certificate for `localhost` and every address of this
/// host, and write it to `dir`.
///
/// Returns the certificate and key paths.
pub fn generate(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let params = certificate_params()?;
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);
    std::fs::write(&cert_path, cert.pem())
        .with_context(|| format!("writing {}", cert_path.display()))?;
    std::fs::write(&key_path, key_pair.serialize_pem())
        .with_context(|| format!("writing {}", key_path.display()))?;
    Ok((cert_path, key_path))
}

fn certificate_params() -> Result<CertificateParams> {
    let mut names = vec!["localhost".to_string()];
    names.extend(local_ips().iter().map(IpAddr::to_string));

    let mut params = CertificateParams::new(names).context("invalid subject alt names")?;
    params.distinguished_name.push(DnType::CommonName, "mqttd");
    Ok(params)
}

/// IPv4 loopback first, then every interface address.
fn local_ips() -> Vec<IpAddr> {
    let interfaces = if_addrs::get_if_addrs().unwrap_or_else(|e| {
        warn!(error = %e, "cannot list network interfaces, using loopback only");
        Vec::new()
    });
    with_loopback(interfaces.iter().map(|iface| iface.ip()))
}

fn with_loopback(addrs: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
    let mut ips = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    for ip in addrs {
        if !ip.is_unspecified() && !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    ips
}
