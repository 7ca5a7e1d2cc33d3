//! Classification of remote failures.
//!
//! Raw transport errors are turned into a `RemoteError` exactly once, here.
//! Everything upstream (retry, list error display) works off the class.

use reqwest::StatusCode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
  /// Connectivity loss. Not retried.
  #[error("No internet connection")]
  NoConnection,
  /// The request timed out. Retried.
  #[error("The request timed out")]
  Timeout,
  /// HTTP error status. Retried for 5xx only.
  #[error("Server error ({0})")]
  ServerError(u16),
  #[error("Unexpected error: {0}")]
  Unknown(String),
}

impl RemoteError {
  /// Whether an automatic retry may succeed.
  pub fn is_transient(&self) -> bool {
    match self {
      RemoteError::Timeout => true,
      RemoteError::ServerError(code) => *code >= 500,
      RemoteError::NoConnection | RemoteError::Unknown(_) => false,
    }
  }

  pub fn from_status(status: StatusCode) -> Self {
    RemoteError::ServerError(status.as_u16())
  }
}

impl From<reqwest::Error> for RemoteError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      RemoteError::Timeout
    } else if err.is_connect() {
      RemoteError::NoConnection
    } else if let Some(status) = err.status() {
      RemoteError::from_status(status)
    } else {
      RemoteError::Unknown(err.to_string())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transient_classes() {
    assert!(RemoteError::Timeout.is_transient());
    assert!(RemoteError::ServerError(500).is_transient());
    assert!(RemoteError::ServerError(503).is_transient());
    assert!(!RemoteError::ServerError(404).is_transient());
    assert!(!RemoteError::ServerError(429).is_transient());
    assert!(!RemoteError::NoConnection.is_transient());
    assert!(!RemoteError::Unknown("boom".into()).is_transient());
  }

  #[tokio::test]
  async fn test_connect_failure_is_no_connection() {
    // Nothing listens on port 9 of the loopback interface
    let err = reqwest::Client::new()
      .get("http://127.0.0.1:9/")
      .send()
      .await
      .unwrap_err();
    assert_eq!(RemoteError::from(err), RemoteError::NoConnection);
  }
}
