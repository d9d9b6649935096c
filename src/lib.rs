//! Local intercepting forward proxy
//!
//! This crate implements a personal traffic-interception and anonymization
//! proxy: it accepts plain HTTP proxy requests and `CONNECT` tunnels,
//! optionally terminates intercepted TLS with per-hostname self-signed
//! leaves, and routes the outbound leg directly, through a pool of upstream
//! HTTP proxies, or through the local tor SOCKS transport.
//!
//! # Features
//!
//! - Per-hostname leaf certificate issuance with an on-disk cache
//! - HTTPS interception (`CONNECT` + rustls server handshake)
//! - Deterministic sticky-per-URL proxy-pool selection
//! - Supervised launch of the anonymizing transport
//! - Runtime-mutable configuration honoring the external command surface
//!
//! # Example
//!
//! ```no_run
//! use wraith::ProxyEngine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = ProxyEngine::new();
//!     engine.set_mitm(true).await;
//!     engine.set_header("user-agent", "Mozilla/5.0").await?;
//!     let running = engine.start().await?;
//!     println!("listening on {}", running.local_addr());
//!     Ok(())
//! }
//! ```

mod certs;
mod config;
mod egress;
mod engine;
mod error;
mod outbound;
mod server;
mod shield;
mod tor;

pub use certs::{CertificateStore, HostCertificate};
pub use config::{IpRotation, ProxyConfig, SharedConfig, StatusReport};
pub use egress::{route, Egress};
pub use engine::{ProxyEngine, RunningProxy};
pub use error::{Error, Result};
pub use server::{ProxyServer, FORWARD_TIMEOUT};
pub use shield::{FingerprintShield, NoShield};
pub use tor::{Readiness, TorSupervisor, TOR_SOCKS_ENDPOINT};
