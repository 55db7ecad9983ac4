//! Bounded exponential backoff for remote calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::error::{ErrorCode, GatewayError, SyncError};

/// Whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  Retryable,
  Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total tries, including the first.
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
  /// The one retry table. Auth, permission, not-found, conflict and validation failures are
  /// terminal; transport, timeout and server failures are retryable.
  pub fn is_retryable_code(code: ErrorCode) -> bool {
    match code {
      ErrorCode::Unauthorized
      | ErrorCode::Forbidden
      | ErrorCode::NotFound
      | ErrorCode::Conflict
      | ErrorCode::Validation => false,
      ErrorCode::Network | ErrorCode::Timeout | ErrorCode::Server | ErrorCode::Unknown => true,
    }
  }

  pub fn classify(&self, err: &GatewayError) -> Classification {
    if Self::is_retryable_code(err.code) {
      Classification::Retryable
    } else {
      Classification::Terminal
    }
  }

  /// Wait before the `retry`-th retry (1-based).
  pub fn delay_for(&self, retry: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry.saturating_sub(1));
    self.base_delay.saturating_mul(factor)
  }
}

/// Runs gateway calls under a [`RetryPolicy`], checking connectivity between attempts.
#[derive(Clone)]
pub struct RetryCoordinator {
  policy: RetryPolicy,
  monitor: Arc<ConnectivityMonitor>,
}

impl RetryCoordinator {
  pub fn new(policy: RetryPolicy, monitor: Arc<ConnectivityMonitor>) -> Self {
    Self { policy, monitor }
  }

  /// Run `operation` until it succeeds, fails terminally or runs out of attempts.
  ///
  /// Before every retry the coordinator backs off and re-probes the network; if it is still
  /// down the call fails with [`SyncError::Connectivity`] without spending the remaining attempts.
  pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, SyncError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
  {
    let max_attempts = self.policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
      match operation().await {
        Ok(value) => {
          if attempt > 1 {
            debug!("{} succeeded on attempt {}", label, attempt);
          }
          return Ok(value);
        }
        Err(err) => {
          warn!("{} attempt {} failed: {}", label, attempt, err);

          if self.policy.classify(&err) == Classification::Terminal || attempt >= max_attempts {
            return Err(SyncError::from_gateway(err, attempt));
          }
        }
      }

      tokio::time::sleep(self.policy.delay_for(attempt)).await;
      if !self.monitor.check().await {
        return Err(SyncError::connectivity(format!(
          "network unreachable before retrying {}",
          label
        )));
      }
      attempt += 1;
    }
  }
}
