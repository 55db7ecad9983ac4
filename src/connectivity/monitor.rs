use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::probe::{OsSignal, ProbeOutcome, ReachabilityProbe};

/// Network reachability as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
  Online,
  Offline,
  /// The OS reported the network is back; a probe is confirming it.
  Reconnecting,
}

impl std::fmt::Display for ConnectivityState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Online => "online",
      Self::Offline => "offline",
      Self::Reconnecting => "reconnecting",
    };
    f.write_str(s)
  }
}

/// Settings for a [`ConnectivityMonitor`].
#[derive(Debug, Clone)]
pub struct ConnectivitySettings {
  /// Independent endpoints to probe. Reachable if any of them answers.
  pub endpoints: Vec<String>,
  /// Per-endpoint limit. A probe that runs over counts as unreachable.
  pub probe_timeout: Duration,
  /// Interval for [`ConnectivityMonitor::spawn_periodic_check`].
  pub check_interval: Duration,
  pub initial: ConnectivityState,
}

impl Default for ConnectivitySettings {
  fn default() -> Self {
    Self {
      endpoints: vec![
        "https://www.google.com/favicon.ico".to_string(),
        "https://httpbin.org/status/200".to_string(),
        "https://jsonplaceholder.typicode.com/posts/1".to_string(),
      ],
      probe_timeout: Duration::from_secs(5),
      check_interval: Duration::from_secs(30),
      initial: ConnectivityState::Online,
    }
  }
}

/// Holds the single authoritative [`ConnectivityState`].
///
/// State only changes through explicit signals: a probe result, or an OS online/offline event.
/// Errors from unrelated remote calls never move it.
pub struct ConnectivityMonitor {
  settings: ConnectivitySettings,
  probe: Arc<dyn ReachabilityProbe>,
  os: Arc<dyn OsSignal>,
  state: watch::Sender<ConnectivityState>,
  transitions: broadcast::Sender<ConnectivityState>,
  /// Bumped by OS events so a slower probe cannot overwrite a newer signal.
  epoch: AtomicU64,
}

impl ConnectivityMonitor {
  pub fn new(
    settings: ConnectivitySettings,
    probe: Arc<dyn ReachabilityProbe>,
    os: Arc<dyn OsSignal>,
  ) -> Self {
    let (state, _) = watch::channel(settings.initial);
    let (transitions, _) = broadcast::channel(16);
    Self {
      settings,
      probe,
      os,
      state,
      transitions,
      epoch: AtomicU64::new(0),
    }
  }

  /// Current state.
  pub fn state(&self) -> ConnectivityState {
    *self.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.state() == ConnectivityState::Online
  }

  pub fn is_offline(&self) -> bool {
    self.state() == ConnectivityState::Offline
  }

  pub fn is_reconnecting(&self) -> bool {
    self.state() == ConnectivityState::Reconnecting
  }

  /// Receive every distinct transition, in order.
  pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityState> {
    self.transitions.subscribe()
  }

  /// Latest-value view of the state.
  pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
    self.state.subscribe()
  }

  /// Probe all endpoints without touching the state.
  ///
  /// Reachable if any endpoint answers. When no endpoint gives a definite answer, falls back to
  /// the OS flag instead of declaring the network down.
  pub async fn probe(&self) -> bool {
    let timeout = self.settings.probe_timeout;
    let checks = self.settings.endpoints.iter().map(|endpoint| async move {
      match tokio::time::timeout(timeout, self.probe.check(endpoint)).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::Unreachable,
      }
    });
    let outcomes = join_all(checks).await;
    debug!("probe outcomes: {:?}", outcomes);

    if outcomes.contains(&ProbeOutcome::Reachable) {
      true
    } else if outcomes.iter().all(|o| *o == ProbeOutcome::Inconclusive) {
      self.os.is_online()
    } else {
      false
    }
  }

  /// Probe and apply the result. Returns whether the network is reachable.
  pub async fn check(&self) -> bool {
    let epoch = self.epoch.load(Ordering::SeqCst);
    let reachable = self.probe().await;
    if self.epoch.load(Ordering::SeqCst) == epoch {
      self.set_state(if reachable {
        ConnectivityState::Online
      } else {
        ConnectivityState::Offline
      });
    } else {
      debug!("discarding probe result superseded by a newer signal");
    }
    reachable
  }

  /// The OS reports the network is back. Moves to `reconnecting` until a probe settles it.
  pub async fn notify_os_online(&self) -> bool {
    self.epoch.fetch_add(1, Ordering::SeqCst);
    self.set_state(ConnectivityState::Reconnecting);
    self.check().await
  }

  /// The OS reports the network is gone.
  pub fn notify_os_offline(&self) {
    self.epoch.fetch_add(1, Ordering::SeqCst);
    self.set_state(ConnectivityState::Offline);
  }

  /// Re-check on the configured interval, starting immediately.
  pub fn spawn_periodic_check(self: &Arc<Self>) -> JoinHandle<()> {
    let monitor = Arc::clone(self);
    let period = monitor.settings.check_interval;
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      loop {
        ticker.tick().await;
        monitor.check().await;
      }
    })
  }

  fn set_state(&self, next: ConnectivityState) {
    let changed = self.state.send_if_modified(|current| {
      if *current == next {
        false
      } else {
        *current = next;
        true
      }
    });
    if changed {
      info!("connectivity -> {}", next);
      // No subscribers is fine.
      let _ = self.transitions.send(next);
    }
  }
}
