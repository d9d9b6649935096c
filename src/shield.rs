//! Fingerprint shield seam
//!
//! The actual fingerprint-spoofing module lives outside this crate; its
//! contract here is narrow: when `anti_fingerprint` is enabled, the shield is
//! handed the outbound header map, applies its passive mutations, and
//! returns. The engine ships a pass-through default.

use crate::error::Result;
use http::HeaderMap;

/// Passive header-mutation hook applied to outbound requests
#[async_trait::async_trait]
pub trait FingerprintShield: Send + Sync {
  /// Mutate the outbound headers in place
  async fn apply(&self, headers: &mut HeaderMap) -> Result<()>;
}

/// Default shield: leaves headers untouched
pub struct NoShield;

#[async_trait::async_trait]
impl FingerprintShield for NoShield {
  async fn apply(&self, _headers: &mut HeaderMap) -> Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn no_shield_leaves_headers_untouched() {
    let mut headers = HeaderMap::new();
    headers.insert("x-probe", "1".parse().unwrap());
    NoShield.apply(&mut headers).await.unwrap();
    assert_eq!(headers.len(), 1);
    assert_eq!(headers["x-probe"], "1");
  }
}
