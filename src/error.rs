//! Error taxonomy for the synchronization layer.
//!
//! Gateway failures arrive as [`GatewayError`] carrying an [`ErrorCode`]. The store classifies
//! them into [`SyncError`], which is what callers and the `last_error` observable see.

use thiserror::Error;

/// Classified failure code reported by a remote gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
  Unauthorized,
  Forbidden,
  NotFound,
  Conflict,
  Validation,
  Network,
  Timeout,
  Server,
  Unknown,
}

impl ErrorCode {
  /// Map a raw backend code (HTTP status, PostgREST code, SQLSTATE) to an [`ErrorCode`].
  ///
  /// This is the single table every gateway implementation should use.
  pub fn from_raw(raw: &str) -> Self {
    match raw.trim() {
      "401" | "PGRST301" => Self::Unauthorized,
      "403" => Self::Forbidden,
      "404" | "PGRST116" => Self::NotFound,
      "409" | "23505" => Self::Conflict,
      "400" | "422" | "23503" | "23502" | "23514" | "VALIDATION_ERROR" => Self::Validation,
      "408" | "504" => Self::Timeout,
      "NETWORK_ERROR" => Self::Network,
      s if s.len() == 3 && s.starts_with('5') && s.chars().all(|c| c.is_ascii_digit()) => {
        Self::Server
      }
      _ => Self::Unknown,
    }
  }

  /// Short stable name, used in logs.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Unauthorized => "unauthorized",
      Self::Forbidden => "forbidden",
      Self::NotFound => "not_found",
      Self::Conflict => "conflict",
      Self::Validation => "validation",
      Self::Network => "network",
      Self::Timeout => "timeout",
      Self::Server => "server",
      Self::Unknown => "unknown",
    }
  }
}

impl std::fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Error returned by a [`RemoteGateway`](crate::gateway::RemoteGateway) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
  pub code: ErrorCode,
  pub message: String,
  /// Retry eligibility as decided by the default [`RetryPolicy`](crate::retry::RetryPolicy) table.
  pub retryable: bool,
}

impl GatewayError {
  pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
      retryable: crate::retry::RetryPolicy::is_retryable_code(code),
    }
  }

  /// Build an error from a raw backend code.
  pub fn from_raw(raw: &str, message: impl Into<String>) -> Self {
    Self::new(ErrorCode::from_raw(raw), message)
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::new(ErrorCode::Network, message)
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::new(ErrorCode::Timeout, message)
  }
}

/// Errors surfaced by the synchronization layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
  /// No viable network path.
  #[error("no network connectivity: {message}")]
  Connectivity { message: String },

  /// Auth, permission, validation, conflict or not-found. Never retried.
  #[error("request rejected ({code}): {message}")]
  TerminalRemote { code: ErrorCode, message: String },

  /// Timeouts, server errors and unknown failures that survived every retry.
  #[error("request failed after {attempts} attempt(s) ({code}): {message}")]
  TransientRemote {
    code: ErrorCode,
    message: String,
    attempts: u32,
  },

  /// No usable offline data.
  #[error("no data available offline")]
  CacheMiss,

  /// There is no valid session, or the last one was invalidated.
  #[error("session is not valid")]
  SessionInvalid,

  /// The record id is not part of the working set.
  #[error("record {id} not found")]
  UnknownRecord { id: String },
}

impl SyncError {
  pub fn connectivity(message: impl Into<String>) -> Self {
    Self::Connectivity {
      message: message.into(),
    }
  }

  pub fn forbidden(message: impl Into<String>) -> Self {
    Self::TerminalRemote {
      code: ErrorCode::Forbidden,
      message: message.into(),
    }
  }

  /// Classify a final gateway error after `attempts` tries.
  pub fn from_gateway(err: GatewayError, attempts: u32) -> Self {
    if crate::retry::RetryPolicy::is_retryable_code(err.code) {
      Self::TransientRemote {
        code: err.code,
        message: err.message,
        attempts,
      }
    } else {
      Self::TerminalRemote {
        code: err.code,
        message: err.message,
      }
    }
  }

  /// Whether the condition is expected to clear once the network comes back.
  pub fn is_connectivity_like(&self) -> bool {
    matches!(self, Self::Connectivity { .. } | Self::TransientRemote { .. })
  }

  pub fn code(&self) -> Option<ErrorCode> {
    match self {
      Self::TerminalRemote { code, .. } | Self::TransientRemote { code, .. } => Some(*code),
      _ => None,
    }
  }
}
