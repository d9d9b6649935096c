//! Per-hostname certificate issuance and caching
//!
//! The proxy terminates intercepted TLS sessions with disposable self-signed
//! leaf certificates, one per hostname, persisted as PEM pairs under a fixed
//! per-user directory (`~/.wraith/certs` by default). Certificates found on
//! disk are reused as-is across restarts; concurrent first requests for the
//! same hostname coalesce into a single generation.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::ServerConfig;

/// Leaf validity period in days
const VALIDITY_DAYS: i64 = 30;

/// One issued (or reloaded) certificate/key pair for a hostname
#[derive(Debug, Clone)]
pub struct HostCertificate {
  /// Hostname the leaf was issued for
  pub hostname: String,
  /// Path of the PEM certificate on disk
  pub cert_path: PathBuf,
  /// Path of the PEM private key on disk
  pub key_path: PathBuf,
  /// Generation time, `None` when the pair was reloaded from disk
  pub issued_at: Option<OffsetDateTime>,
  /// End of the validity window, `None` when reloaded; never enforced
  pub valid_until: Option<OffsetDateTime>,
  cert_pem: String,
  key_pem: String,
}

impl HostCertificate {
  /// Certificate in PEM format
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// Build the rustls server configuration used for the interception handshake
  pub fn tls_server_config(&self) -> Result<ServerConfig> {
    let certs = rustls_pemfile::certs(&mut self.cert_pem.as_bytes())
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|e| Error::certificate_error(format!("failed to parse stored PEM: {}", e)))?;
    if certs.is_empty() {
      return Err(Error::certificate_error(format!(
        "no certificate found in {}",
        self.cert_path.display()
      )));
    }
    let key = rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
      .map_err(|e| Error::certificate_error(format!("failed to parse stored key: {}", e)))?
      .ok_or_else(|| {
        Error::certificate_error(format!("no private key found in {}", self.key_path.display()))
      })?;
    ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(certs, key)
      .map_err(|e| Error::tls_error(format!("failed to create TLS config: {}", e)))
  }
}

/// On-disk certificate store with an in-memory single-flight cache
pub struct CertificateStore {
  dir: PathBuf,
  cache: Cache<String, HostCertificate>,
}

impl CertificateStore {
  /// Create a store rooted at `dir`; the directory is created on first generation
  pub fn new(dir: impl AsRef<Path>) -> Self {
    Self {
      dir: dir.as_ref().to_path_buf(),
      cache: Cache::builder().max_capacity(1024).build(),
    }
  }

  /// Fixed per-user certificate directory
  pub fn default_dir() -> PathBuf {
    std::env::var_os("HOME")
      .or_else(|| std::env::var_os("USERPROFILE"))
      .map(PathBuf::from)
      .unwrap_or_else(|| PathBuf::from("."))
      .join(".wraith")
      .join("certs")
  }

  /// Storage directory
  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Get the certificate/key pair for `hostname`, generating it on first use
  ///
  /// Concurrent calls for the same hostname share one generation; repeated
  /// calls return the same pair. Stored pairs are reused with no validity
  /// check.
  pub async fn acquire(&self, hostname: &str) -> Result<HostCertificate> {
    let is_ip = hostname.parse::<IpAddr>().is_ok();
    if hostname.is_empty()
      || (!is_ip
        && (hostname
          .chars()
          .any(|c| c == '/' || c == '\\' || c == ':' || c.is_whitespace())
          || hostname.contains("..")))
    {
      return Err(Error::certificate_error(format!(
        "refusing to issue certificate for '{}'",
        hostname
      )));
    }
    let dir = self.dir.clone();
    let host = hostname.to_string();
    self
      .cache
      .try_get_with(host.clone(), Self::load_or_generate(dir, host))
      .await
      .map_err(|e| Error::certificate_error(e.to_string()))
  }

  async fn load_or_generate(dir: PathBuf, hostname: String) -> Result<HostCertificate> {
    let cert_path = dir.join(format!("{}.pem", hostname));
    let key_path = dir.join(format!("{}.key", hostname));

    // Cache hit on disk: reuse the stored pair without any validity check
    if fs::try_exists(&cert_path).await.unwrap_or(false)
      && fs::try_exists(&key_path).await.unwrap_or(false)
    {
      let cert_pem = fs::read_to_string(&cert_path).await?;
      let key_pem = fs::read_to_string(&key_path).await?;
      return Ok(HostCertificate {
        hostname,
        cert_path,
        key_path,
        issued_at: None,
        valid_until: None,
        cert_pem,
        key_pem,
      });
    }

    fs::create_dir_all(&dir).await?;

    let (cert_pem, key_pem, issued_at, valid_until) = Self::generate_leaf(&hostname)?;

    let mut cert_file = fs::File::create(&cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;

    let mut key_file = fs::File::create(&key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;

    Ok(HostCertificate {
      hostname,
      cert_path,
      key_path,
      issued_at: Some(issued_at),
      valid_until: Some(valid_until),
      cert_pem,
      key_pem,
    })
  }

  /// Generate a self-signed leaf: subject and issuer CN are both the hostname
  fn generate_leaf(hostname: &str) -> Result<(String, String, OffsetDateTime, OffsetDateTime)> {
    let mut params = CertificateParams::default();

    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    // IP literals get an iPAddress SAN, everything else a dNSName SAN
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::certificate_error(format!("invalid domain name: {}", hostname))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("failed to generate key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("failed to self-sign leaf: {}", e)))?;

    Ok((
      cert.pem(),
      key_pair.serialize_pem(),
      now,
      now + Duration::days(VALIDITY_DAYS),
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn rejects_hostnames_unfit_for_filenames() {
    let store = CertificateStore::new(std::env::temp_dir().join("wraith-test-reject"));
    for bad in ["", "a/b", "..", "host name", "host:443"] {
      assert!(store.acquire(bad).await.is_err(), "accepted '{}'", bad);
    }
  }

  #[test]
  fn generated_leaf_is_pem_encoded() {
    let (cert_pem, key_pem, issued_at, valid_until) =
      CertificateStore::generate_leaf("example.com").unwrap();
    assert!(cert_pem.contains("BEGIN CERTIFICATE"));
    assert!(key_pem.contains("PRIVATE KEY"));
    assert_eq!(valid_until - issued_at, Duration::days(VALIDITY_DAYS));
  }
}
