//! Egress routing: direct, anonymizing SOCKS transport, or pooled HTTP proxy
//!
//! Routing never fails: a disabled transport or an empty pool simply falls
//! through to a direct connection.

use crate::config::{IpRotation, ProxyConfig};
use crate::tor::TOR_SOCKS_ENDPOINT;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// The outbound path carrying one forwarded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Egress {
  /// Connect straight to the origin
  Direct,
  /// SOCKS5 through the local anonymizing transport on 127.0.0.1:9150
  Tor,
  /// One upstream HTTP proxy from the pool, `host:port`
  Pool(String),
}

impl Egress {
  /// Address of the proxy hop, if the path has one
  pub fn proxy_addr(&self) -> Option<&str> {
    match self {
      Egress::Direct => None,
      Egress::Tor => Some(TOR_SOCKS_ENDPOINT),
      Egress::Pool(entry) => Some(entry.as_str()),
    }
  }
}

/// Pick the egress path for a request URL under the current configuration
///
/// The anonymizing transport takes precedence over rotation. Per-request
/// rotation is sticky: the pool entry is `pool[hash(url) % len]`, so the same
/// URL string maps to the same proxy for as long as the pool is unchanged.
pub fn route(url: &str, config: &ProxyConfig) -> Egress {
  if config.tor_enabled {
    return Egress::Tor;
  }
  if config.ip_rotation == IpRotation::PerRequest && !config.proxy_pool.is_empty() {
    let index = url_hash(url) as usize % config.proxy_pool.len();
    return Egress::Pool(config.proxy_pool[index].clone());
  }
  Egress::Direct
}

// DefaultHasher::new() uses fixed keys, so selection is stable for a given
// URL string within and across runs.
fn url_hash(url: &str) -> u64 {
  let mut hasher = DefaultHasher::new();
  url.hash(&mut hasher);
  hasher.finish()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pool_config(pool: &[&str]) -> ProxyConfig {
    ProxyConfig {
      ip_rotation: IpRotation::PerRequest,
      proxy_pool: pool.iter().map(|s| s.to_string()).collect(),
      ..Default::default()
    }
  }

  #[test]
  fn tor_takes_precedence_over_rotation() {
    let mut config = pool_config(&["1.2.3.4:8000"]);
    config.tor_enabled = true;
    let egress = route("http://example.com/", &config);
    assert_eq!(egress, Egress::Tor);
    assert_eq!(egress.proxy_addr(), Some(TOR_SOCKS_ENDPOINT));
    assert_eq!(Egress::Direct.proxy_addr(), None);
  }

  #[test]
  fn disabled_rotation_goes_direct() {
    let mut config = pool_config(&["1.2.3.4:8000"]);
    config.ip_rotation = IpRotation::Disabled;
    assert_eq!(route("http://example.com/", &config), Egress::Direct);
  }

  #[test]
  fn empty_pool_falls_through_to_direct() {
    let config = pool_config(&[]);
    assert_eq!(route("http://example.com/", &config), Egress::Direct);
  }

  #[test]
  fn per_request_selection_is_sticky_per_url() {
    let config = pool_config(&["1.2.3.4:8000", "5.6.7.8:8000"]);
    let first = route("http://example.com/", &config);
    assert!(matches!(first, Egress::Pool(_)));
    for _ in 0..32 {
      assert_eq!(route("http://example.com/", &config), first);
    }
  }

  #[test]
  fn selection_uses_the_exact_url_string() {
    let config = pool_config(&[
      "1.2.3.4:8000",
      "5.6.7.8:8000",
      "9.9.9.9:8000",
      "10.0.0.1:8000",
    ]);
    // some pair of distinct URLs must land on distinct entries
    let urls = [
      "http://example.com/",
      "http://example.com/a",
      "http://example.com/b",
      "http://example.org/",
      "http://example.net/",
    ];
    let picks: Vec<Egress> = urls.iter().map(|u| route(u, &config)).collect();
    assert!(picks.windows(2).any(|w| w[0] != w[1]));
  }
}
