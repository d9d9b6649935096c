//! Error types for the proxy engine

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy engine operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Listener could not bind (port in use or insufficient privilege)
  #[error("Bind error: {0}")]
  Bind(String),

  /// Certificate generation or storage failure
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// Outbound leg failure (DNS, connect, timeout, read)
  #[error("Forward error: {0}")]
  Forward(String),

  /// Anonymizing transport could not be found or started
  #[error("Transport error: {0}")]
  Transport(String),

  /// HTTP parsing error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Rejected configuration value
  #[error("Config error: {0}")]
  Config(String),
}

impl Error {
  /// Create a bind error and log it
  pub fn bind_error(msg: impl Into<String>) -> Self {
    let error = Error::Bind(msg.into());
    tracing::error!("Bind error: {}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create a forward error and log it
  pub fn forward_error(msg: impl Into<String>) -> Self {
    let error = Error::Forward(msg.into());
    tracing::debug!("Forward error: {}", error);
    error
  }

  /// Create a transport error and log it
  pub fn transport_error(msg: impl Into<String>) -> Self {
    let error = Error::Transport(msg.into());
    tracing::error!("Transport error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("Invalid request: {}", error);
    error
  }

  /// Create a config error
  pub fn config_error(msg: impl Into<String>) -> Self {
    Error::Config(msg.into())
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}
