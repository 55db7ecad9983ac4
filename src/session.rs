//! Identity and session validity, as an input to the store.

use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::info;

/// Supplies the current owner and whether their session is still valid.
pub trait SessionProvider: Send + Sync {
  fn current_owner_id(&self) -> Option<String>;

  fn is_session_valid(&self) -> bool;

  /// Receives the owner id each time a session is invalidated.
  fn subscribe_invalidated(&self) -> broadcast::Receiver<String>;
}

#[derive(Debug, Default)]
struct SessionState {
  owner_id: Option<String>,
  valid: bool,
}

/// A [`SessionProvider`] driven directly by the host (sign-in/sign-out events).
pub struct StaticSession {
  state: Mutex<SessionState>,
  invalidated: broadcast::Sender<String>,
}

impl Default for StaticSession {
  fn default() -> Self {
    let (invalidated, _) = broadcast::channel(8);
    Self {
      state: Mutex::new(SessionState::default()),
      invalidated,
    }
  }
}

impl StaticSession {
  pub fn signed_in(owner_id: impl Into<String>) -> Self {
    let session = Self::default();
    session.sign_in(owner_id);
    session
  }

  fn state(&self) -> MutexGuard<'_, SessionState> {
    self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn sign_in(&self, owner_id: impl Into<String>) {
    let mut state = self.state();
    state.owner_id = Some(owner_id.into());
    state.valid = true;
  }

  /// Mark the session invalid and notify subscribers.
  pub fn invalidate(&self) {
    let owner = {
      let mut state = self.state();
      state.valid = false;
      state.owner_id.take()
    };
    if let Some(owner) = owner {
      info!("session of {} invalidated", owner);
      let _ = self.invalidated.send(owner);
    }
  }
}

impl SessionProvider for StaticSession {
  fn current_owner_id(&self) -> Option<String> {
    self.state().owner_id.clone()
  }

  fn is_session_valid(&self) -> bool {
    let state = self.state();
    state.valid && state.owner_id.is_some()
  }

  fn subscribe_invalidated(&self) -> broadcast::Receiver<String> {
    self.invalidated.subscribe()
  }
}
