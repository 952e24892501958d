//! HTTPS for `coop serve`. Either a certificate pair supplied by the user,
//! used as-is, or a self-signed one kept under the data directory and issued
//! for the names the worker is reached by.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};

/// Names every self-signed certificate covers.
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1"];

/// Lists the names a generated certificate was issued for, one per line.
const HOSTS_FILE: &str = "cert.hosts";

enum CertSource {
    Supplied,
    SelfSigned { hosts: Vec<String> },
}

pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    source: CertSource,
}

impl TlsConfig {
    /// Pick the certificate for a server bound to `bind`.
    ///
    /// `--tls-cert` and `--tls-key` go together. Without them the
    /// self-signed pair in `<data_dir>/tls` is used, covering the loopback
    /// names, a concrete bind address and any `extra_hosts`.
    pub fn resolve(
        data_dir: &Path,
        bind: &str,
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
        extra_hosts: &[String],
    ) -> Result<Self> {
        match (cert, key) {
            (Some(cert_path), Some(key_path)) => Ok(Self {
                cert_path,
                key_path,
                source: CertSource::Supplied,
            }),
            (Some(_), None) | (None, Some(_)) => {
                bail!("--tls-cert and --tls-key must be given together")
            }
            (None, None) => {
                let dir = data_dir.join("tls");
                std::fs::create_dir_all(&dir).with_context(|| {
                    format!("Failed to create TLS directory: {}", dir.display())
                })?;
                Ok(Self {
                    cert_path: dir.join("cert.pem"),
                    key_path: dir.join("key.pem"),
                    source: CertSource::SelfSigned {
                        hosts: cert_hosts(bind, extra_hosts),
                    },
                })
            }
        }
    }

    /// Make sure the pair exists and fits, generating the self-signed one
    /// when it is missing or was issued for other names. Returns the SHA-256
    /// fingerprint to pin on devices.
    pub fn ensure(&self) -> Result<String> {
        match &self.source {
            CertSource::Supplied => {
                for path in [&self.cert_path, &self.key_path] {
                    if !path.exists() {
                        bail!("TLS file not found: {}", path.display());
                    }
                }
                fingerprint_from_pem_file(&self.cert_path)
            }
            CertSource::SelfSigned { hosts } => {
                if self.cert_path.exists()
                    && self.key_path.exists()
                    && self.issued_hosts().is_some_and(|issued| {
                        hosts.iter().all(|h| issued.contains(h))
                    })
                {
                    return fingerprint_from_pem_file(&self.cert_path);
                }
                tracing::info!(
                    path = %self.cert_path.display(),
                    hosts = %hosts.join(","),
                    "generating self-signed TLS certificate"
                );
                let fingerprint =
                    generate_self_signed_cert(&self.cert_path, &self.key_path, hosts)?;
                std::fs::write(self.hosts_path(), hosts.join("\n"))
                    .context("Failed to record certificate names")?;
                Ok(fingerprint)
            }
        }
    }

    fn hosts_path(&self) -> PathBuf {
        self.cert_path.with_file_name(HOSTS_FILE)
    }

    fn issued_hosts(&self) -> Option<Vec<String>> {
        let contents = std::fs::read_to_string(self.hosts_path()).ok()?;
        Some(contents.lines().map(str::to_string).collect())
    }
}

/// Loopback names, then the bind address unless it is a wildcard, then extras.
fn cert_hosts(bind: &str, extra: &[String]) -> Vec<String> {
    let mut hosts: Vec<String> = LOOPBACK_HOSTS.iter().map(|h| (*h).to_string()).collect();
    let bind = bind.trim().trim_start_matches('[').trim_end_matches(']');
    let wildcard = bind
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_unspecified());
    let candidates = (!wildcard && !bind.is_empty())
        .then_some(bind)
        .into_iter()
        .chain(extra.iter().map(|h| h.trim()));
    for host in candidates {
        if !host.is_empty() && !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
    }
    hosts
}

/// Write a fresh self-signed pair for `hosts` and return its fingerprint.
/// IP literals become IP SANs, everything else a DNS SAN.
fn generate_self_signed_cert(cert_path: &Path, key_path: &Path, hosts: &[String]) -> Result<String> {
    let mut params = rcgen::CertificateParams::new(hosts.to_vec())
        .context("invalid name for the TLS certificate")?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "coop worker self-signed");
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, "coop");

    let key_pair = rcgen::KeyPair::generate().context("failed to generate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed certificate")?;

    std::fs::write(cert_path, cert.pem())
        .with_context(|| format!("Failed to write certificate to {}", cert_path.display()))?;
    std::fs::write(key_path, key_pair.serialize_pem())
        .with_context(|| format!("Failed to write private key to {}", key_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
            .context("Failed to set private key permissions")?;
    }

    Ok(sha256_fingerprint(cert.der()))
}

/// Uppercase hex pairs joined by colons.
fn sha256_fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .fold(String::with_capacity(95), |mut acc, b| {
            if !acc.is_empty() {
                acc.push(':');
            }
            let _ = write!(acc, "{b:02X}");
            acc
        })
}

fn fingerprint_from_pem_file(cert_path: &Path) -> Result<String> {
    let pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read certificate from {}", cert_path.display()))?;
    let first = rustls_pemfile::certs(&mut pem.as_slice())
        .next()
        .context("No certificate found in PEM file")?
        .context("Malformed certificate in PEM file")?;
    Ok(sha256_fingerprint(first.as_ref()))
}
