//! Proxy engine facade and startup orchestration
//!
//! Ties the shared configuration, certificate store, transport supervisor
//! and fingerprint shield together, and honors the external command surface:
//! configuration mutators, `start` and `status`.

use crate::certs::CertificateStore;
use crate::config::{IpRotation, SharedConfig, StatusReport};
use crate::error::Result;
use crate::server::ProxyServer;
use crate::shield::{FingerprintShield, NoShield};
use crate::tor::TorSupervisor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// The proxy engine: configuration plus everything `start` wires together
pub struct ProxyEngine {
  config: SharedConfig,
  certs: Arc<CertificateStore>,
  tor: TorSupervisor,
  shield: Arc<dyn FingerprintShield>,
  forward_timeout: Option<Duration>,
}

impl Default for ProxyEngine {
  fn default() -> Self {
    Self::new()
  }
}

impl ProxyEngine {
  /// Engine with the per-user certificate directory and default supervisor
  pub fn new() -> Self {
    Self::with_cert_dir(CertificateStore::default_dir())
  }

  /// Engine storing certificates under `dir`
  pub fn with_cert_dir(dir: impl AsRef<Path>) -> Self {
    Self {
      config: SharedConfig::default(),
      certs: Arc::new(CertificateStore::new(dir)),
      tor: TorSupervisor::default(),
      shield: Arc::new(NoShield),
      forward_timeout: None,
    }
  }

  /// Replace the transport supervisor
  pub fn with_supervisor(mut self, tor: TorSupervisor) -> Self {
    self.tor = tor;
    self
  }

  /// Install a fingerprint shield implementation
  pub fn with_shield(mut self, shield: Arc<dyn FingerprintShield>) -> Self {
    self.shield = shield;
    self
  }

  /// Override the outbound deadline (defaults to the fixed 20 seconds)
  pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
    self.forward_timeout = Some(timeout);
    self
  }

  /// Handle to the shared runtime configuration
  pub fn config(&self) -> SharedConfig {
    self.config.clone()
  }

  /// Certificate store used for interception handshakes
  pub fn certs(&self) -> Arc<CertificateStore> {
    self.certs.clone()
  }

  /// `set ip-rotation <disabled|per-request>`
  pub async fn set_ip_rotation(&self, mode: &str) -> Result<IpRotation> {
    self.config.set_ip_rotation(mode).await
  }

  /// `set header <key> <value>`
  pub async fn set_header(&self, name: &str, value: &str) -> Result<()> {
    self.config.insert_header(name, value).await
  }

  /// `enable tor`
  pub async fn enable_tor(&self) {
    self.config.enable_tor().await
  }

  /// `enable anti-fingerprint`
  pub async fn enable_anti_fingerprint(&self) {
    self.config.enable_anti_fingerprint().await
  }

  /// Toggle CONNECT interception
  pub async fn set_mitm(&self, enabled: bool) {
    self.config.set_mitm(enabled).await
  }

  /// Change the port the next `start` binds
  pub async fn set_listen_port(&self, port: u16) {
    self.config.set_listen_port(port).await
  }

  /// Replace the proxy pool (write path of the external fetcher)
  pub async fn set_proxy_pool(&self, pool: Vec<String>) {
    self.config.set_proxy_pool(pool).await
  }

  /// `status` — read-only configuration dump plus pool size
  pub async fn status(&self) -> StatusReport {
    self.config.status().await
  }

  /// `start` — bring up the transport if routed through it, bind and serve
  ///
  /// A supervisor failure aborts startup: the proxy never serves with tor
  /// routing configured but unavailable. Bind failures surface as
  /// `Error::Bind` and leave the process alive.
  pub async fn start(&self) -> Result<RunningProxy> {
    let config = self.config.snapshot().await;

    if config.tor_enabled {
      self.tor.ensure_ready().await?;
    }

    let mut server = ProxyServer::new(self.config.clone(), self.certs.clone(), self.shield.clone());
    if let Some(timeout) = self.forward_timeout {
      server = server.with_forward_timeout(timeout);
    }

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.listen_port);
    let listener = server.bind(addr)?;
    let local_addr = listener.local_addr()?;
    let handle = tokio::spawn(server.run(listener));
    tracing::info!("proxy listening on {}", local_addr);

    Ok(RunningProxy { local_addr, handle })
  }
}

/// A started proxy: the bound address and the accept-loop task
pub struct RunningProxy {
  local_addr: SocketAddr,
  handle: JoinHandle<()>,
}

impl RunningProxy {
  /// Address the listener is bound to
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stop accepting connections
  pub fn shutdown(self) {
    self.handle.abort();
  }
}
