//! Runtime configuration shared between the command surface and connection handlers
//!
//! The configuration is written by a single external actor (the command
//! shell) and read by every in-flight connection handler. Handlers take a
//! cloned snapshot per request so a concurrent write can never be observed
//! half-applied.

use crate::error::{Error, Result};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Outbound IP rotation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpRotation {
  /// No rotation, requests go out directly unless tor routing is enabled
  #[default]
  Disabled,
  /// Pick a pool proxy per request, sticky per URL
  PerRequest,
}

impl FromStr for IpRotation {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "disabled" => Ok(IpRotation::Disabled),
      "per-request" => Ok(IpRotation::PerRequest),
      other => Err(Error::config_error(format!(
        "invalid ip-rotation mode '{}', expected 'disabled' or 'per-request'",
        other
      ))),
    }
  }
}

impl fmt::Display for IpRotation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      IpRotation::Disabled => f.write_str("disabled"),
      IpRotation::PerRequest => f.write_str("per-request"),
    }
  }
}

/// Process-wide proxy settings
#[derive(Debug, Clone)]
pub struct ProxyConfig {
  /// Outbound IP rotation mode
  pub ip_rotation: IpRotation,
  /// Route all outbound traffic through the anonymizing SOCKS transport
  pub tor_enabled: bool,
  /// Apply the fingerprint shield to outbound headers
  pub anti_fingerprint: bool,
  /// Static headers attached to every forwarded request
  pub extra_headers: HeaderMap,
  /// Upstream HTTP proxy pool, `host:port` entries
  pub proxy_pool: Vec<String>,
  /// Allow CONNECT interception (TLS termination with a locally issued leaf)
  pub mitm_enabled: bool,
  /// Listener port
  pub listen_port: u16,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      ip_rotation: IpRotation::Disabled,
      tor_enabled: false,
      anti_fingerprint: false,
      extra_headers: HeaderMap::new(),
      proxy_pool: Vec::new(),
      mitm_enabled: false,
      listen_port: 8080,
    }
  }
}

/// Shared handle to the runtime configuration
///
/// Cloning the handle shares the same underlying configuration.
#[derive(Clone, Default)]
pub struct SharedConfig {
  inner: Arc<RwLock<ProxyConfig>>,
}

impl SharedConfig {
  /// Create a handle around an initial configuration
  pub fn new(config: ProxyConfig) -> Self {
    Self {
      inner: Arc::new(RwLock::new(config)),
    }
  }

  /// Take a consistent snapshot of the current configuration
  pub async fn snapshot(&self) -> ProxyConfig {
    self.inner.read().await.clone()
  }

  /// `set ip-rotation <disabled|per-request>` — rejects any other value
  pub async fn set_ip_rotation(&self, mode: &str) -> Result<IpRotation> {
    let mode: IpRotation = mode.parse()?;
    self.inner.write().await.ip_rotation = mode;
    Ok(mode)
  }

  /// `set header <key> <value>` — upserts a static outbound header
  pub async fn insert_header(&self, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|e| Error::config_error(format!("invalid header name '{}': {}", name, e)))?;
    let value = HeaderValue::from_str(value)
      .map_err(|e| Error::config_error(format!("invalid header value: {}", e)))?;
    self.inner.write().await.extra_headers.insert(name, value);
    Ok(())
  }

  /// `enable tor`
  pub async fn enable_tor(&self) {
    self.inner.write().await.tor_enabled = true;
  }

  /// `enable anti-fingerprint`
  pub async fn enable_anti_fingerprint(&self) {
    self.inner.write().await.anti_fingerprint = true;
  }

  /// Toggle CONNECT interception
  pub async fn set_mitm(&self, enabled: bool) {
    self.inner.write().await.mitm_enabled = enabled;
  }

  /// Change the listener port used by the next `start`
  pub async fn set_listen_port(&self, port: u16) {
    self.inner.write().await.listen_port = port;
  }

  /// Replace the proxy pool wholesale (the external fetcher's write path)
  pub async fn set_proxy_pool(&self, pool: Vec<String>) {
    self.inner.write().await.proxy_pool = pool;
  }

  /// Read-only status dump for the `status` command
  pub async fn status(&self) -> StatusReport {
    let config = self.inner.read().await;
    StatusReport {
      ip_rotation: config.ip_rotation,
      tor_enabled: config.tor_enabled,
      anti_fingerprint: config.anti_fingerprint,
      mitm_enabled: config.mitm_enabled,
      listen_port: config.listen_port,
      extra_headers: config
        .extra_headers
        .iter()
        .map(|(k, v)| {
          (
            k.as_str().to_string(),
            String::from_utf8_lossy(v.as_bytes()).to_string(),
          )
        })
        .collect(),
      pool_size: config.proxy_pool.len(),
    }
  }
}

/// Textual status report, the only UI surface in scope
#[derive(Debug, Clone)]
pub struct StatusReport {
  pub ip_rotation: IpRotation,
  pub tor_enabled: bool,
  pub anti_fingerprint: bool,
  pub mitm_enabled: bool,
  pub listen_port: u16,
  pub extra_headers: Vec<(String, String)>,
  pub pool_size: usize,
}

impl fmt::Display for StatusReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "ip-rotation: {}", self.ip_rotation)?;
    writeln!(f, "tor: {}", self.tor_enabled)?;
    writeln!(f, "anti-fingerprint: {}", self.anti_fingerprint)?;
    writeln!(f, "mitm: {}", self.mitm_enabled)?;
    writeln!(f, "listen-port: {}", self.listen_port)?;
    for (name, value) in &self.extra_headers {
      writeln!(f, "header: {}: {}", name, value)?;
    }
    write!(f, "proxy-pool: {} proxies", self.pool_size)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rotation_mode_parsing() {
    assert_eq!(
      "disabled".parse::<IpRotation>().unwrap(),
      IpRotation::Disabled
    );
    assert_eq!(
      "per-request".parse::<IpRotation>().unwrap(),
      IpRotation::PerRequest
    );
    assert!("round-robin".parse::<IpRotation>().is_err());
    assert!("".parse::<IpRotation>().is_err());
  }

  #[tokio::test]
  async fn set_ip_rotation_rejects_unknown_modes() {
    let config = SharedConfig::default();
    assert!(config.set_ip_rotation("per-request").await.is_ok());
    assert!(config.set_ip_rotation("random").await.is_err());
    // rejected writes leave the previous value in place
    assert_eq!(
      config.snapshot().await.ip_rotation,
      IpRotation::PerRequest
    );
  }

  #[tokio::test]
  async fn header_upsert_is_case_insensitive() {
    let config = SharedConfig::default();
    config.insert_header("X-Ghost", "one").await.unwrap();
    config.insert_header("x-ghost", "two").await.unwrap();
    let snapshot = config.snapshot().await;
    assert_eq!(snapshot.extra_headers.len(), 1);
    assert_eq!(snapshot.extra_headers["x-ghost"], "two");
  }

  #[tokio::test]
  async fn snapshot_is_isolated_from_later_writes() {
    let config = SharedConfig::default();
    let before = config.snapshot().await;
    config.enable_tor().await;
    assert!(!before.tor_enabled);
    assert!(config.snapshot().await.tor_enabled);
  }
}
