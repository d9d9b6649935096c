//! Outbound leg: connection establishment over the selected egress path
//!
//! A forwarded request reaches its origin either directly, through an
//! upstream HTTP proxy from the pool (absolute-form for `http` targets,
//! `CONNECT` tunnel for `https`), or through the local SOCKS5 anonymizing
//! transport with remote DNS so hostname resolution happens inside the
//! anonymizing network.

use crate::egress::Egress;
use crate::error::{Error, Result};
use http::{HeaderMap, StatusCode};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

const MAX_HEAD_LINE: usize = 8 * 1024;
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Parsed request target
#[derive(Debug, Clone)]
pub(crate) struct Target {
  pub host: String,
  pub port: u16,
  pub https: bool,
  /// Authority exactly as it appeared in the URL, used for the `Host` header
  pub authority: String,
  pub origin_form: String,
  pub absolute_form: String,
}

impl Target {
  pub fn parse(url: &str) -> Result<Self> {
    let uri: http::Uri = url
      .parse()
      .map_err(|e| Error::invalid_request(format!("invalid target URL '{}': {}", url, e)))?;
    let https = uri.scheme_str() == Some("https");
    let host = uri
      .host()
      .ok_or_else(|| Error::invalid_request(format!("no host in URL '{}'", url)))?
      .to_string();
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
    let authority = uri
      .authority()
      .map(|a| a.as_str().to_string())
      .unwrap_or_else(|| host.clone());
    let origin_form = uri
      .path_and_query()
      .map(|p| p.as_str())
      .filter(|p| !p.is_empty())
      .unwrap_or("/")
      .to_string();
    Ok(Self {
      host,
      port,
      https,
      authority,
      origin_form,
      absolute_form: url.to_string(),
    })
  }

  pub fn host_port(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}

/// Plain or TLS-wrapped outbound stream
pub(crate) enum MaybeTlsStream {
  Tcp(TcpStream),
  Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

/// Outbound connector, one per server
pub(crate) struct Outbound {
  tls: TlsConnector,
}

impl Outbound {
  /// Connector that verifies origin certificates against the webpki roots
  pub fn new() -> Self {
    Self::with_verification(true)
  }

  pub fn with_verification(verify_certs: bool) -> Self {
    Self {
      tls: tls_connector(verify_certs),
    }
  }

  /// Open a stream to `target` over `egress`, TLS-upgraded for https targets
  pub async fn connect(&self, target: &Target, egress: &Egress) -> Result<MaybeTlsStream> {
    match egress {
      Egress::Direct => {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
          .await
          .map_err(|e| {
            Error::forward_error(format!("failed to connect to {}: {}", target.host_port(), e))
          })?;
        self.maybe_upgrade(stream, target).await
      }
      Egress::Tor => {
        let mut stream = TcpStream::connect(crate::tor::TOR_SOCKS_ENDPOINT)
          .await
          .map_err(|e| {
            Error::forward_error(format!("anonymizing transport unreachable: {}", e))
          })?;
        socks5_connect(&mut stream, &target.host, target.port).await?;
        self.maybe_upgrade(stream, target).await
      }
      Egress::Pool(entry) => {
        let mut stream = TcpStream::connect(entry.as_str()).await.map_err(|e| {
          Error::forward_error(format!("pool proxy {} unreachable: {}", entry, e))
        })?;
        if target.https {
          http_connect_tunnel(&mut stream, &target.host_port()).await?;
          self.maybe_upgrade(stream, target).await
        } else {
          // plain http rides the proxy in absolute-form, no tunnel needed
          Ok(MaybeTlsStream::Tcp(stream))
        }
      }
    }
  }

  async fn maybe_upgrade(&self, stream: TcpStream, target: &Target) -> Result<MaybeTlsStream> {
    if !target.https {
      return Ok(MaybeTlsStream::Tcp(stream));
    }
    let name = ServerName::try_from(target.host.clone())
      .map_err(|e| Error::tls_error(format!("invalid server name '{}': {}", target.host, e)))?;
    let tls = self
      .tls
      .connect(name, stream)
      .await
      .map_err(|e| Error::forward_error(format!("TLS connect to {} failed: {}", target.host, e)))?;
    Ok(MaybeTlsStream::Tls(Box::new(tls)))
  }
}

fn tls_connector(verify_certs: bool) -> TlsConnector {
  let provider = rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
  let builder = rustls::ClientConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()
    .expect("ring provider supports the default protocol versions");
  let config = if verify_certs {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    builder.with_root_certificates(roots).with_no_client_auth()
  } else {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  };
  TlsConnector::from(Arc::new(config))
}

/// Status line and headers of an origin response; the body stays on the reader
#[derive(Debug)]
pub(crate) struct ResponseHead {
  pub status: StatusCode,
  pub headers: HeaderMap,
}

/// Read and parse a response head, leaving the reader at the body
pub(crate) async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  reader.read_until(b'\n', &mut line).await?;
  if line.is_empty() {
    return Err(Error::forward_error("origin closed before responding"));
  }
  if line.len() > MAX_HEAD_LINE {
    return Err(Error::forward_error("status line too long"));
  }
  let status = parse_status_line(&line)?;

  let mut headers = HeaderMap::new();
  let mut total = line.len();
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
    total += n;
    if total > MAX_HEAD_SIZE {
      return Err(Error::forward_error("response head too large"));
    }
    let trimmed = line.strip_suffix(b"\r\n").or_else(|| line.strip_suffix(b"\n")).unwrap_or(&line);
    if let Some(idx) = trimmed.iter().position(|b| *b == b':') {
      let (name, value) = trimmed.split_at(idx);
      let value = value[1..].trim_ascii();
      if let (Ok(name), Ok(value)) = (
        http::HeaderName::from_bytes(name),
        http::HeaderValue::from_bytes(value),
      ) {
        headers.append(name, value);
      }
    }
  }
  Ok(ResponseHead { status, headers })
}

fn parse_status_line(line: &[u8]) -> Result<StatusCode> {
  let text = String::from_utf8_lossy(line);
  let mut parts = text.split_whitespace();
  let version = parts
    .next()
    .ok_or_else(|| Error::forward_error("empty status line"))?;
  if !version.starts_with("HTTP/") {
    return Err(Error::forward_error(format!(
      "invalid status line: {}",
      text.trim_end()
    )));
  }
  let code = parts
    .next()
    .ok_or_else(|| Error::forward_error("status line without code"))?;
  StatusCode::from_bytes(code.as_bytes())
    .map_err(|_| Error::forward_error(format!("invalid status code: {}", code)))
}

/// SOCKS5 CONNECT with no authentication and remote DNS (domain ATYP)
async fn socks5_connect(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
  use consts::*;

  stream
    .write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE])
    .await?;
  let mut reply = [0u8; 2];
  stream.read_exact(&mut reply).await?;
  if reply[0] != SOCKS5_VERSION || reply[1] != SOCKS5_AUTH_METHOD_NONE {
    return Err(Error::forward_error(
      "SOCKS5 server refused no-auth negotiation",
    ));
  }

  let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_TCP_CONNECT, 0x00];
  match host.parse::<std::net::IpAddr>() {
    Ok(std::net::IpAddr::V4(ip)) => {
      request.push(SOCKS5_ADDR_TYPE_IPV4);
      request.extend_from_slice(&ip.octets());
    }
    Ok(std::net::IpAddr::V6(ip)) => {
      request.push(SOCKS5_ADDR_TYPE_IPV6);
      request.extend_from_slice(&ip.octets());
    }
    Err(_) => {
      if host.len() > u8::MAX as usize {
        return Err(Error::forward_error("domain name too long for SOCKS5"));
      }
      request.push(SOCKS5_ADDR_TYPE_DOMAIN_NAME);
      request.push(host.len() as u8);
      request.extend_from_slice(host.as_bytes());
    }
  }
  request.extend_from_slice(&port.to_be_bytes());
  stream.write_all(&request).await?;
  stream.flush().await?;

  let mut head = [0u8; 4];
  stream.read_exact(&mut head).await?;
  let [version, reply, _rsv, atyp] = head;
  if version != SOCKS5_VERSION {
    return Err(Error::forward_error(format!(
      "unexpected SOCKS version {}",
      version
    )));
  }
  if reply != SOCKS5_REPLY_SUCCEEDED {
    return Err(Error::forward_error(format!(
      "SOCKS5 connect failed: {}",
      reply_message(reply)
    )));
  }
  // drain the bound address so the stream is positioned at payload bytes
  let addr_len = match atyp {
    SOCKS5_ADDR_TYPE_IPV4 => 4,
    SOCKS5_ADDR_TYPE_IPV6 => 16,
    SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
      let mut len = [0u8; 1];
      stream.read_exact(&mut len).await?;
      len[0] as usize
    }
    other => {
      return Err(Error::forward_error(format!(
        "unsupported SOCKS5 address type {}",
        other
      )))
    }
  };
  let mut bound = vec![0u8; addr_len + 2];
  stream.read_exact(&mut bound).await?;
  Ok(())
}

fn reply_message(code: u8) -> &'static str {
  use consts::*;
  match code {
    SOCKS5_REPLY_GENERAL_FAILURE => "general failure",
    SOCKS5_REPLY_CONNECTION_NOT_ALLOWED => "connection not allowed by ruleset",
    SOCKS5_REPLY_NETWORK_UNREACHABLE => "network unreachable",
    SOCKS5_REPLY_HOST_UNREACHABLE => "host unreachable",
    SOCKS5_REPLY_CONNECTION_REFUSED => "connection refused",
    SOCKS5_REPLY_TTL_EXPIRED => "TTL expired",
    SOCKS5_REPLY_COMMAND_NOT_SUPPORTED => "command not supported",
    SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
    _ => "unknown reply",
  }
}

/// Tunnel through an upstream HTTP proxy with CONNECT, expecting a 200
async fn http_connect_tunnel(stream: &mut TcpStream, host_port: &str) -> Result<()> {
  let request = format!(
    "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: Keep-Alive\r\n\r\n",
    host_port
  );
  stream.write_all(request.as_bytes()).await?;
  stream.flush().await?;

  // read the reply head byte-wise so no TLS bytes end up buffered
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  loop {
    let n = stream.read(&mut byte).await?;
    if n == 0 {
      return Err(Error::forward_error("proxy closed during CONNECT"));
    }
    head.push(byte[0]);
    if head.ends_with(b"\r\n\r\n") {
      break;
    }
    if head.len() > MAX_HEAD_SIZE {
      return Err(Error::forward_error("proxy CONNECT reply too large"));
    }
  }
  let status = parse_status_line(&head)?;
  if status != StatusCode::OK {
    return Err(Error::forward_error(format!(
      "proxy refused CONNECT: {}",
      status
    )));
  }
  Ok(())
}

#[rustfmt::skip]
mod consts {
  pub const SOCKS5_VERSION: u8 = 0x05;

  pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;

  pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;

  pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
  pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

  pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
  pub const SOCKS5_REPLY_GENERAL_FAILURE: u8 = 0x01;
  pub const SOCKS5_REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
  pub const SOCKS5_REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
  pub const SOCKS5_REPLY_HOST_UNREACHABLE: u8 = 0x04;
  pub const SOCKS5_REPLY_CONNECTION_REFUSED: u8 = 0x05;
  pub const SOCKS5_REPLY_TTL_EXPIRED: u8 = 0x06;
  pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
  pub const SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls_pki_types::CertificateDer,
    _intermediates: &[rustls_pki_types::CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: rustls_pki_types::UnixTime,
  ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::danger::ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &rustls::DigitallySignedStruct,
  ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
    Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &rustls::DigitallySignedStruct,
  ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
    Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
    vec![
      rustls::SignatureScheme::RSA_PKCS1_SHA1,
      rustls::SignatureScheme::ECDSA_SHA1_Legacy,
      rustls::SignatureScheme::RSA_PKCS1_SHA256,
      rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
      rustls::SignatureScheme::RSA_PKCS1_SHA384,
      rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
      rustls::SignatureScheme::RSA_PKCS1_SHA512,
      rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
      rustls::SignatureScheme::RSA_PSS_SHA256,
      rustls::SignatureScheme::RSA_PSS_SHA384,
      rustls::SignatureScheme::RSA_PSS_SHA512,
      rustls::SignatureScheme::ED25519,
      rustls::SignatureScheme::ED448,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[test]
  fn target_defaults_scheme_ports() {
    let http = Target::parse("http://example.com/a?b=1").unwrap();
    assert_eq!(http.host, "example.com");
    assert_eq!(http.port, 80);
    assert!(!http.https);
    assert_eq!(http.origin_form, "/a?b=1");
    assert_eq!(http.authority, "example.com");

    let https = Target::parse("https://example.com:8443").unwrap();
    assert_eq!(https.port, 8443);
    assert!(https.https);
    assert_eq!(https.origin_form, "/");
    assert_eq!(https.authority, "example.com:8443");
  }

  #[test]
  fn target_rejects_url_without_host() {
    assert!(Target::parse("/relative/path").is_err());
    assert!(Target::parse("not a url").is_err());
  }

  #[tokio::test]
  async fn parses_response_head_and_leaves_body() {
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Multi: a\r\nX-Multi: b\r\n\r\nhello";
    let mut reader = BufReader::new(raw);
    let head = read_response_head(&mut reader).await.unwrap();
    assert_eq!(head.status, StatusCode::OK);
    assert_eq!(head.headers["content-type"], "text/plain");
    assert_eq!(
      head
        .headers
        .get_all("x-multi")
        .iter()
        .collect::<Vec<_>>()
        .len(),
      2
    );
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"hello");
  }

  #[tokio::test]
  async fn rejects_non_http_status_line() {
    let raw: &[u8] = b"SSH-2.0-OpenSSH\r\n";
    let mut reader = BufReader::new(raw);
    assert!(read_response_head(&mut reader).await.is_err());
  }
}
