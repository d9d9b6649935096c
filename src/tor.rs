//! Anonymizing-transport supervision
//!
//! Verifies that the local tor SOCKS endpoint is reachable and, if not,
//! locates the tor binary through a platform-specific search order, launches
//! it detached, and waits for readiness. Failure here propagates to `start`,
//! which aborts rather than serving unanonymized traffic.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};

/// SOCKS5 endpoint of the local anonymizing transport
pub const TOR_SOCKS_ENDPOINT: &str = "127.0.0.1:9150";

/// Timeout for a single reachability probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// How the supervisor decides a freshly launched transport is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
  /// Blind fixed wait, then optimistic success — the legacy conformance mode
  Grace(Duration),
  /// Bounded poll of the SOCKS port until it accepts or the deadline passes
  Poll {
    /// Give up after this long
    timeout: Duration,
    /// Delay between probes
    interval: Duration,
  },
}

impl Default for Readiness {
  fn default() -> Self {
    Readiness::Poll {
      timeout: Duration::from_secs(15),
      interval: Duration::from_millis(250),
    }
  }
}

impl Readiness {
  /// The legacy 3-second blind grace period
  pub fn legacy_grace() -> Self {
    Readiness::Grace(Duration::from_secs(3))
  }
}

/// Supervisor for the external SOCKS-capable anonymizing process
pub struct TorSupervisor {
  endpoint: String,
  readiness: Readiness,
  command: Option<PathBuf>,
}

impl Default for TorSupervisor {
  fn default() -> Self {
    Self {
      endpoint: TOR_SOCKS_ENDPOINT.to_string(),
      readiness: Readiness::default(),
      command: None,
    }
  }
}

impl TorSupervisor {
  /// Supervisor with the default endpoint and polling readiness
  pub fn new() -> Self {
    Self::default()
  }

  /// Override the probed endpoint (the routed endpoint stays fixed)
  pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.endpoint = endpoint.into();
    self
  }

  /// Select the readiness mode
  pub fn with_readiness(mut self, readiness: Readiness) -> Self {
    self.readiness = readiness;
    self
  }

  /// Use an explicit binary instead of the platform search order
  pub fn with_command(mut self, command: impl Into<PathBuf>) -> Self {
    self.command = Some(command.into());
    self
  }

  /// Make sure the anonymizing transport is running
  ///
  /// Idempotent: if the endpoint already accepts connections this returns
  /// immediately with no side effect. Otherwise the binary is located,
  /// launched detached with its output discarded, and readiness is awaited
  /// per the configured mode.
  pub async fn ensure_ready(&self) -> Result<()> {
    if self.probe().await {
      return Ok(());
    }

    let binary = match &self.command {
      Some(path) => path.clone(),
      None => locate_binary()
        .ok_or_else(|| Error::transport_error("tor binary not found, install it manually"))?,
    };

    Command::new(&binary)
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .spawn()
      .map_err(|e| {
        Error::transport_error(format!("failed to start {}: {}", binary.display(), e))
      })?;
    tracing::info!("launched anonymizing transport: {}", binary.display());

    match self.readiness {
      Readiness::Grace(grace) => {
        // No re-probe after the wait: optimistic success by contract
        sleep(grace).await;
        Ok(())
      }
      Readiness::Poll {
        timeout: deadline,
        interval,
      } => {
        let give_up = Instant::now() + deadline;
        loop {
          sleep(interval).await;
          if self.probe().await {
            return Ok(());
          }
          if Instant::now() >= give_up {
            return Err(Error::transport_error(format!(
              "transport did not become ready on {} within {:?}",
              self.endpoint, deadline
            )));
          }
        }
      }
    }
  }

  async fn probe(&self) -> bool {
    matches!(
      timeout(PROBE_TIMEOUT, TcpStream::connect(&self.endpoint)).await,
      Ok(Ok(_))
    )
  }
}

/// Platform-specific search order: well-known paths, then PATH lookup
fn locate_binary() -> Option<PathBuf> {
  if cfg!(target_os = "macos") {
    for candidate in ["/opt/homebrew/bin/tor", "/usr/local/bin/tor"] {
      let path = PathBuf::from(candidate);
      if path.is_file() {
        return Some(path);
      }
    }
  }
  if cfg!(windows) {
    let mut candidates = Vec::new();
    if let Some(home) = std::env::var_os("USERPROFILE") {
      candidates.push(PathBuf::from(home).join("tor").join("tor.exe"));
    }
    candidates.push(PathBuf::from("C:/tor/tor.exe"));
    for path in candidates {
      if path.is_file() {
        return Some(path);
      }
    }
    return search_path("tor.exe");
  }
  search_path("tor")
}

fn search_path(name: &str) -> Option<PathBuf> {
  let path = std::env::var_os("PATH")?;
  std::env::split_paths(&path)
    .map(|dir| dir.join(name))
    .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn probe_success_short_circuits() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // a nonexistent command proves launch is never attempted
    let supervisor = TorSupervisor::new()
      .with_endpoint(addr.to_string())
      .with_command("/nonexistent/tor");
    supervisor.ensure_ready().await.unwrap();
  }

  #[tokio::test]
  async fn missing_binary_fails_launch() {
    let supervisor = TorSupervisor::new()
      // unroutable-enough: nothing listens on this loopback port in tests
      .with_endpoint("127.0.0.1:1")
      .with_command("/nonexistent/tor")
      .with_readiness(Readiness::Grace(Duration::from_millis(10)));
    let result = supervisor.ensure_ready().await;
    assert!(matches!(result, Err(Error::Transport(_))));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn grace_mode_reports_optimistic_success() {
    // /bin/true exits immediately and never listens; the legacy contract
    // still reports success after the blind wait
    let supervisor = TorSupervisor::new()
      .with_endpoint("127.0.0.1:1")
      .with_command("/bin/true")
      .with_readiness(Readiness::Grace(Duration::from_millis(50)));
    supervisor.ensure_ready().await.unwrap();
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn poll_mode_times_out_when_port_never_opens() {
    let supervisor = TorSupervisor::new()
      .with_endpoint("127.0.0.1:1")
      .with_command("/bin/true")
      .with_readiness(Readiness::Poll {
        timeout: Duration::from_millis(200),
        interval: Duration::from_millis(50),
      });
    assert!(supervisor.ensure_ready().await.is_err());
  }
}
