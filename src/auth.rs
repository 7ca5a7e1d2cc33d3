//! Current-user accessor.
//!
//! Session management lives elsewhere; this crate only needs to know who is
//! signed in and to observe sign-in transitions.

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
  #[error("Not signed in")]
  Unauthenticated,
}

pub trait AuthContext: Send + Sync {
  fn current_user_id(&self) -> Result<String, AuthError>;
}

/// Signed-in user held in a watch channel so services can react to changes.
#[derive(Debug)]
pub struct Session {
  tx: watch::Sender<Option<String>>,
}

impl Session {
  pub fn new(user_id: Option<String>) -> Self {
    let (tx, _rx) = watch::channel(user_id);
    Self { tx }
  }

  pub fn sign_in(&self, user_id: impl Into<String>) {
    self.tx.send_replace(Some(user_id.into()));
  }

  pub fn sign_out(&self) {
    self.tx.send_replace(None);
  }

  /// Receiver that observes every change of the signed-in user.
  pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
    self.tx.subscribe()
  }
}

impl AuthContext for Session {
  fn current_user_id(&self) -> Result<String, AuthError> {
    self.tx.borrow().clone().ok_or(AuthError::Unauthenticated)
  }
}
