//! # Authentication Seam
//!
//! The engine never authenticates anyone. It reads the current user and
//! watches sign-in/sign-out transitions through [`AuthProvider`].

use tokio::sync::watch;
use tracing::info;

use medsync_core::UserId;

/// Source of the signed-in user.
pub trait AuthProvider: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;

    /// Receiver that changes on every sign-in and sign-out.
    fn subscribe(&self) -> watch::Receiver<Option<UserId>>;
}

/// Watch-backed [`AuthProvider`] driven by the host application.
#[derive(Debug, Clone)]
pub struct AuthState {
    tx: watch::Sender<Option<UserId>>,
}

impl AuthState {
    pub fn signed_out() -> Self {
        let (tx, _) = watch::channel(None);
        AuthState { tx }
    }

    pub fn signed_in(user_id: impl Into<UserId>) -> Self {
        let (tx, _) = watch::channel(Some(user_id.into()));
        AuthState { tx }
    }

    pub fn sign_in(&self, user_id: impl Into<UserId>) {
        let user_id = user_id.into();
        info!(user_id = %user_id, "User signed in");
        self.tx.send_replace(Some(user_id));
    }

    pub fn sign_out(&self) {
        info!("User signed out");
        self.tx.send_replace(None);
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::signed_out()
    }
}

impl AuthProvider for AuthState {
    fn current_user_id(&self) -> Option<UserId> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<UserId>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_are_observed() {
        let auth = AuthState::signed_out();
        let mut rx = auth.subscribe();
        assert_eq!(auth.current_user_id(), None);

        auth.sign_in("user-1");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_deref(), Some("user-1"));

        auth.sign_out();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_none());
    }
}
