//! Proxy listener and per-connection handling
//!
//! The accept loop spawns one task per connection and never blocks on a
//! handler. A handler consumes exactly one client connection: a `CONNECT`
//! request is answered with an interception handshake and one decrypted
//! exchange; anything else is forwarded as a plain proxy request. All
//! per-connection failures are contained here and never reach the listener.

use crate::certs::CertificateStore;
use crate::config::SharedConfig;
use crate::egress::{route, Egress};
use crate::error::{Error, Result};
use crate::outbound::{read_response_head, MaybeTlsStream, Outbound, ResponseHead, Target};
use crate::shield::FingerprintShield;
use http::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

/// Deadline for the outbound connect, request write and response-head read
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(20);

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_HEADERS_SIZE: usize = 16 * 1024;

/// Proxy server: listener plus everything a connection handler needs
#[derive(Clone)]
pub struct ProxyServer {
  config: SharedConfig,
  certs: Arc<CertificateStore>,
  shield: Arc<dyn FingerprintShield>,
  outbound: Arc<Outbound>,
  forward_timeout: Duration,
}

impl ProxyServer {
  /// Create a server sharing the given configuration and certificate store
  pub fn new(
    config: SharedConfig,
    certs: Arc<CertificateStore>,
    shield: Arc<dyn FingerprintShield>,
  ) -> Self {
    Self {
      config,
      certs,
      shield,
      outbound: Arc::new(Outbound::new()),
      forward_timeout: FORWARD_TIMEOUT,
    }
  }

  /// Override the outbound deadline (the default is the fixed 20 seconds)
  pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
    self.forward_timeout = timeout;
    self
  }

  /// Bind the listening socket with address reuse enabled
  ///
  /// A `PermissionDenied` from the OS (privileged port without privilege)
  /// surfaces as a `Bind` error to the caller, not a process failure.
  pub fn bind(&self, addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
      .map_err(|e| Error::bind_error(format!("failed to create socket: {}", e)))?;
    socket
      .set_reuse_address(true)
      .map_err(|e| Error::bind_error(format!("failed to set SO_REUSEADDR: {}", e)))?;
    socket
      .set_nonblocking(true)
      .map_err(|e| Error::bind_error(format!("failed to set nonblocking: {}", e)))?;
    socket.bind(&addr.into()).map_err(|e| {
      if e.kind() == std::io::ErrorKind::PermissionDenied {
        Error::bind_error(format!(
          "binding {} requires elevated privileges, try a port above 1024",
          addr
        ))
      } else {
        Error::bind_error(format!("failed to bind {}: {}", addr, e))
      }
    })?;
    socket
      .listen(1024)
      .map_err(|e| Error::bind_error(format!("failed to listen on {}: {}", addr, e)))?;
    TcpListener::from_std(socket.into())
      .map_err(|e| Error::bind_error(format!("failed to register listener: {}", e)))
  }

  /// Accept connections forever, one task per connection
  pub async fn run(self, listener: TcpListener) {
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let server = self.clone();
          tokio::spawn(async move {
            if let Err(e) = server.handle_connection(stream, peer_addr).await {
              tracing::debug!("[{}] connection ended with error: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("failed to accept connection: {}", e);
        }
      }
    }
  }

  /// Handle one accepted client connection
  async fn handle_connection(self, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    let request_line = read_line(&mut stream).await?;
    let line = String::from_utf8_lossy(&request_line);
    let mut parts = line.split_whitespace();
    let method = parts
      .next()
      .ok_or_else(|| Error::invalid_request("empty request line"))?
      .to_string();
    let raw_target = parts
      .next()
      .ok_or_else(|| Error::invalid_request(format!("invalid request line: {}", line.trim_end())))?
      .to_string();
    tracing::debug!("[{}] {} {}", peer_addr, method, raw_target);

    drain_headers(&mut stream).await?;

    if method == "CONNECT" {
      self.handle_connect(stream, &raw_target).await
    } else {
      self.handle_exchange(stream, &method, &raw_target, None).await
    }
  }

  /// Answer a CONNECT with interception or a refusal
  async fn handle_connect(self, mut stream: TcpStream, target: &str) -> Result<()> {
    let config = self.config.snapshot().await;
    if !config.mitm_enabled {
      stream.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await?;
      return Ok(());
    }

    let (host, port) = parse_host_port(target)?;
    // certificate and TLS config must be in hand before the 200 goes out
    let acceptor = match self.certs.acquire(&host).await.and_then(|cert| {
      cert
        .tls_server_config()
        .map(|tls| TlsAcceptor::from(Arc::new(tls)))
    }) {
      Ok(acceptor) => acceptor,
      Err(e) => {
        tracing::error!("certificate unavailable for {}: {}", host, e);
        stream
          .write_all(b"HTTP/1.1 500 Internal Server Error\r\n\r\n")
          .await?;
        return Ok(());
      }
    };

    stream
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    stream.flush().await?;

    let mut tls_stream = match acceptor.accept(stream).await {
      Ok(tls) => tls,
      Err(e) => {
        // nothing can be sent to the client after the 200
        tracing::debug!("TLS handshake with client failed for {}: {}", host, e);
        return Ok(());
      }
    };

    let authority = format!("{}:{}", host, port);
    let request_line = read_line(&mut tls_stream).await?;
    let line = String::from_utf8_lossy(&request_line);
    let mut parts = line.split_whitespace();
    let method = match parts.next() {
      Some(m) if !m.is_empty() => m.to_string(),
      _ => return Ok(()), // client opened the tunnel and went away
    };
    let raw_target = parts
      .next()
      .ok_or_else(|| Error::invalid_request(format!("invalid request line: {}", line.trim_end())))?
      .to_string();
    drain_headers(&mut tls_stream).await?;

    // one request per tunnel: deliberate scope limit
    self
      .handle_exchange(tls_stream, &method, &raw_target, Some(&authority))
      .await
  }

  /// Forward one plain request and relay the response
  async fn handle_exchange<S>(
    &self,
    mut client: S,
    method: &str,
    raw_target: &str,
    tunnel: Option<&str>,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let config = self.config.snapshot().await;
    let url = normalize_target(raw_target, tunnel);
    let egress = route(&url, &config);

    let fetched = timeout(
      self.forward_timeout,
      self.fetch(&config.extra_headers, config.anti_fingerprint, method, &url, &egress),
    )
    .await
    .map_err(|_| Error::forward_error(format!("outbound request to {} timed out", url)))
    .and_then(|r| r);

    match fetched {
      Ok((head, reader)) => {
        // the head is committed to the client now; later failures cannot
        // be turned into a 502
        if let Err(e) = relay_response(&mut client, head, reader).await {
          tracing::debug!("response relay for {} aborted: {}", url, e);
        }
      }
      Err(e) => {
        tracing::debug!("forwarding {} failed: {}", url, e);
        let _ = client
          .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\nProxy Error")
          .await;
      }
    }
    let _ = client.shutdown().await;
    Ok(())
  }

  /// Connect over the egress path, send the request, read the response head
  async fn fetch(
    &self,
    extra_headers: &HeaderMap,
    anti_fingerprint: bool,
    method: &str,
    url: &str,
    egress: &Egress,
  ) -> Result<(ResponseHead, BufReader<MaybeTlsStream>)> {
    let target = Target::parse(url)?;

    // outbound headers are the configured statics plus Host; client headers
    // are not propagated
    let mut headers = extra_headers.clone();
    headers.insert(
      HOST,
      HeaderValue::from_str(&target.authority)
        .map_err(|e| Error::invalid_request(format!("invalid host '{}': {}", target.authority, e)))?,
    );
    if anti_fingerprint {
      self.shield.apply(&mut headers).await?;
    }

    let mut stream = self.outbound.connect(&target, egress).await?;

    // absolute-form only when riding an upstream HTTP proxy untunneled
    let absolute = matches!(egress, Egress::Pool(_)) && !target.https;
    let request_target = if absolute {
      &target.absolute_form
    } else {
      &target.origin_form
    };
    let mut request = Vec::with_capacity(256);
    request.extend_from_slice(method.as_bytes());
    request.push(b' ');
    request.extend_from_slice(request_target.as_bytes());
    request.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers.iter() {
      request.extend_from_slice(name.as_str().as_bytes());
      request.extend_from_slice(b": ");
      request.extend_from_slice(value.as_bytes());
      request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let head = read_response_head(&mut reader).await?;
    Ok((head, reader))
  }
}

/// Write the response head and stream the body through to the client
async fn relay_response<S, R>(client: &mut S, head: ResponseHead, mut reader: R) -> Result<()>
where
  S: AsyncWrite + Unpin,
  R: AsyncBufRead + Unpin,
{
  let mut buf = Vec::with_capacity(256);
  let status_line = format!(
    "HTTP/1.1 {} {}\r\n",
    head.status.as_u16(),
    head.status.canonical_reason().unwrap_or("Unknown")
  );
  buf.extend_from_slice(status_line.as_bytes());
  for (name, value) in head.headers.iter() {
    if is_hop_by_hop(name) {
      continue;
    }
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
  }
  buf.extend_from_slice(b"\r\n");
  client.write_all(&buf).await?;

  let chunked = head
    .headers
    .get(TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.eq_ignore_ascii_case("chunked"))
    .unwrap_or(false);
  if chunked {
    relay_chunked(&mut reader, client).await?;
  } else if let Some(length) = head
    .headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse::<u64>().ok())
  {
    tokio::io::copy(&mut (&mut reader).take(length), client).await?;
  } else {
    // no framing: stream until the origin closes
    tokio::io::copy(&mut reader, client).await?;
  }
  client.flush().await?;
  Ok(())
}

/// Decode a chunked body and stream the decoded bytes
///
/// The `Transfer-Encoding` header is never relayed, so the client sees a
/// connection-delimited body.
async fn relay_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      return Err(Error::forward_error("origin closed inside chunked body"));
    }
    let text = String::from_utf8_lossy(&line);
    let size_field = text.trim().split(';').next().unwrap_or("").to_string();
    if size_field.is_empty() {
      continue; // stray CRLF between chunks
    }
    let size = usize::from_str_radix(&size_field, 16)
      .map_err(|_| Error::forward_error(format!("invalid chunk size: {}", size_field)))?;
    if size == 0 {
      // drain optional trailers up to the final blank line
      loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 || line == b"\r\n" || line == b"\n" {
          break;
        }
      }
      return Ok(());
    }
    tokio::io::copy(&mut (&mut *reader).take(size as u64), writer).await?;
  }
}

fn is_hop_by_hop(name: &http::HeaderName) -> bool {
  *name == CONTENT_ENCODING || *name == TRANSFER_ENCODING || *name == CONNECTION
}

/// Read one CRLF-terminated line byte-wise, without over-reading
async fn read_line<S>(stream: &mut S) -> Result<Vec<u8>>
where
  S: AsyncRead + Unpin,
{
  let mut line = Vec::new();
  let mut byte = [0u8; 1];
  loop {
    let n = stream.read(&mut byte).await?;
    if n == 0 {
      break;
    }
    line.push(byte[0]);
    if byte[0] == b'\n' {
      break;
    }
    if line.len() > MAX_REQUEST_LINE {
      return Err(Error::invalid_request("request line too long"));
    }
  }
  Ok(line)
}

/// Consume and discard request headers up to the blank line
async fn drain_headers<S>(stream: &mut S) -> Result<()>
where
  S: AsyncRead + Unpin,
{
  let mut total = 0usize;
  loop {
    let line = read_line(stream).await?;
    if line.is_empty() || line == b"\r\n" || line == b"\n" {
      return Ok(());
    }
    total += line.len();
    if total > MAX_HEADERS_SIZE {
      return Err(Error::invalid_request("request headers too large"));
    }
  }
}

/// Build the outbound URL from the request target
///
/// Inside a tunnel an origin-form target is resolved against the CONNECT
/// authority; outside, a schemeless target defaults to http.
fn normalize_target(raw: &str, tunnel: Option<&str>) -> String {
  if raw.starts_with("http://") || raw.starts_with("https://") {
    return raw.to_string();
  }
  match tunnel {
    Some(authority) => {
      if raw.starts_with('/') {
        format!("https://{}{}", authority, raw)
      } else {
        format!("https://{}/{}", authority, raw)
      }
    }
    None => format!("http://{}", raw.trim_start_matches('/')),
  }
}

/// Split a CONNECT authority into host and port, defaulting to 443
fn parse_host_port(target: &str) -> Result<(String, u16)> {
  if let Some(rest) = target.strip_prefix('[') {
    // bracketed IPv6 literal
    let end = rest
      .find(']')
      .ok_or_else(|| Error::invalid_request(format!("unterminated IPv6 literal '{}'", target)))?;
    let host = rest[..end].to_string();
    let port = match rest[end + 1..].strip_prefix(':') {
      Some(port) => port
        .parse::<u16>()
        .map_err(|_| Error::invalid_request(format!("invalid port in '{}'", target)))?,
      None => 443,
    };
    return Ok((host, port));
  }
  match target.rsplit_once(':') {
    Some((host, port)) => {
      let port = port
        .parse::<u16>()
        .map_err(|_| Error::invalid_request(format!("invalid port in '{}'", target)))?;
      Ok((host.to_string(), port))
    }
    None => Ok((target.to_string(), 443)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[test]
  fn normalizes_schemeless_targets() {
    assert_eq!(
      normalize_target("example.com/x", None),
      "http://example.com/x"
    );
    assert_eq!(
      normalize_target("/example.com", None),
      "http://example.com"
    );
    assert_eq!(
      normalize_target("http://example.com/", None),
      "http://example.com/"
    );
  }

  #[test]
  fn tunnel_targets_resolve_against_the_connect_authority() {
    assert_eq!(
      normalize_target("/index.html", Some("example.com:443")),
      "https://example.com:443/index.html"
    );
    assert_eq!(
      normalize_target("https://other.example/", Some("example.com:443")),
      "https://other.example/"
    );
  }

  #[test]
  fn parses_connect_authority() {
    assert_eq!(
      parse_host_port("example.com:443").unwrap(),
      ("example.com".to_string(), 443)
    );
    assert_eq!(
      parse_host_port("example.com").unwrap(),
      ("example.com".to_string(), 443)
    );
    assert_eq!(
      parse_host_port("example.com:8443").unwrap(),
      ("example.com".to_string(), 8443)
    );
    assert!(parse_host_port("example.com:notaport").is_err());
  }

  #[test]
  fn hop_by_hop_headers_are_recognized() {
    assert!(is_hop_by_hop(&CONTENT_ENCODING));
    assert!(is_hop_by_hop(&TRANSFER_ENCODING));
    assert!(is_hop_by_hop(&CONNECTION));
    assert!(!is_hop_by_hop(&CONTENT_LENGTH));
  }

  #[tokio::test]
  async fn chunked_bodies_are_decoded_while_relaying() {
    let raw: &[u8] = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let mut reader = BufReader::new(raw);
    let mut out = Vec::new();
    relay_chunked(&mut reader, &mut out).await.unwrap();
    assert_eq!(out, b"hello world");
  }

  #[tokio::test]
  async fn chunked_relay_skips_extensions_and_trailers() {
    let raw: &[u8] = b"4;ext=1\r\nwrap\r\n0\r\nTrailer: x\r\n\r\n";
    let mut reader = BufReader::new(raw);
    let mut out = Vec::new();
    relay_chunked(&mut reader, &mut out).await.unwrap();
    assert_eq!(out, b"wrap");
  }
}
