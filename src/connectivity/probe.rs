//! Reachability probes and the OS-reported online flag.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Result of checking a single endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
  /// The endpoint answered (any status).
  Reachable,
  /// Timed out or could not connect.
  Unreachable,
  /// The check could not tell either way (blocked, rejected by the client, etc.).
  Inconclusive,
}

/// Checks whether an endpoint can be reached.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
  async fn check(&self, endpoint: &str) -> ProbeOutcome;
}

/// Online flag as reported by the operating system or host environment.
pub trait OsSignal: Send + Sync {
  fn is_online(&self) -> bool;
}

/// An [`OsSignal`] the host sets explicitly.
#[derive(Debug)]
pub struct ManualOsSignal {
  online: AtomicBool,
}

impl ManualOsSignal {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
    }
  }

  pub fn set(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }
}

impl Default for ManualOsSignal {
  fn default() -> Self {
    Self::new(true)
  }
}

impl OsSignal for ManualOsSignal {
  fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}

/// HTTP `HEAD` probe.
pub struct HttpProbe {
  client: reqwest::Client,
}

impl HttpProbe {
  pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .connect_timeout(timeout)
      .build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
  async fn check(&self, endpoint: &str) -> ProbeOutcome {
    match self
      .client
      .head(endpoint)
      .header(reqwest::header::CACHE_CONTROL, "no-cache")
      .send()
      .await
    {
      Ok(_) => ProbeOutcome::Reachable,
      Err(e) if e.is_timeout() || e.is_connect() => ProbeOutcome::Unreachable,
      Err(e) => {
        tracing::debug!("probe of {} inconclusive: {}", endpoint, e);
        ProbeOutcome::Inconclusive
      }
    }
  }
}

/// Probe with fixed, settable answers per endpoint.
///
/// Endpoints without an answer use the default outcome.
pub struct StaticProbe {
  default: Mutex<ProbeOutcome>,
  answers: Mutex<HashMap<String, ProbeOutcome>>,
  delay: Option<Duration>,
}

impl StaticProbe {
  pub fn new(default: ProbeOutcome) -> Self {
    Self {
      default: Mutex::new(default),
      answers: Mutex::new(HashMap::new()),
      delay: None,
    }
  }

  /// Sleep this long before answering.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn set_default(&self, outcome: ProbeOutcome) {
    if let Ok(mut d) = self.default.lock() {
      *d = outcome;
    }
  }

  pub fn set(&self, endpoint: &str, outcome: ProbeOutcome) {
    if let Ok(mut answers) = self.answers.lock() {
      answers.insert(endpoint.to_string(), outcome);
    }
  }
}

#[async_trait]
impl ReachabilityProbe for StaticProbe {
  async fn check(&self, endpoint: &str) -> ProbeOutcome {
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    let answer = self
      .answers
      .lock()
      .ok()
      .and_then(|a| a.get(endpoint).copied());
    match answer {
      Some(outcome) => outcome,
      None => self
        .default
        .lock()
        .map(|d| *d)
        .unwrap_or(ProbeOutcome::Inconclusive),
    }
  }
}
