//! Exponential backoff for remote calls.

use std::future::Future;
use std::time::Duration;

use crate::remote::RemoteError;

/// Retry schedule for transient remote failures.
///
/// Attempts are counted in total, so the default (3 attempts, 1s base)
/// sleeps 1s then 2s before giving up.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_secs(1),
    }
  }
}

impl RetryPolicy {
  /// Delay before attempt `attempt + 1`, for a zero-based `attempt`.
  pub fn delay_after(&self, attempt: u32) -> Duration {
    self.base_delay * 2u32.saturating_pow(attempt)
  }

  /// Run `op`, retrying transient failures.
  ///
  /// Non-transient errors are returned immediately.
  pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RemoteError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
  {
    let mut attempt = 0;
    loop {
      match op().await {
        Ok(value) => {
          if attempt > 0 {
            tracing::info!(target: "scentshelf::retry", operation, attempt, "Succeeded after retry");
          }
          return Ok(value);
        }
        Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
          let delay = self.delay_after(attempt);
          tracing::warn!(
            target: "scentshelf::retry",
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient error, retrying"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => {
          tracing::warn!(target: "scentshelf::retry", operation, attempt, error = %err, "Giving up");
          return Err(err);
        }
      }
    }
  }
}
