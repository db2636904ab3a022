use std::future::{Future, pending};

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::{
    error::AppError,
    state_machine::{SessionInput, SessionStateMachine},
    types::{AppEvent, SessionState, UserIdentity},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("auth provider unavailable: {0}")]
    Unavailable(String),
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::remote_unavailable(err.to_string())
    }
}

/// Authentication collaborator yielding the current user identity.
pub trait AuthProvider: Send + Sync {
    fn current_identity(&self) -> Option<UserIdentity>;

    /// Watch channel carrying the identity, updated on every auth-state change.
    fn subscribe(&self) -> watch::Receiver<Option<UserIdentity>>;

    fn sign_out(&self) -> impl Future<Output = Result<(), AuthError>> + Send;
}

/// Explicit auth session: subscribe on init, unsubscribe on dispose.
///
/// Components needing an identity receive the session (or the identity it
/// yields) instead of reading ambient global auth state.
#[derive(Debug)]
pub struct AuthSession {
    machine: SessionStateMachine,
    identity_rx: Option<watch::Receiver<Option<UserIdentity>>>,
}

impl AuthSession {
    /// Subscribe to `provider` and adopt its current identity.
    pub fn init<P: AuthProvider>(provider: &P) -> Result<(Self, Vec<AppEvent>), AppError> {
        let mut rx = provider.subscribe();
        let identity = rx.borrow_and_update().clone();

        let mut machine = SessionStateMachine::default();
        let events = machine.apply(SessionInput::Init { identity })?;
        debug!(state = ?machine.state(), "auth session initialized");

        Ok((
            Self {
                machine,
                identity_rx: Some(rx),
            },
            events,
        ))
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn identity(&self) -> Option<&UserIdentity> {
        self.machine.identity()
    }

    pub fn require_identity(&self, action: &str) -> Result<UserIdentity, AppError> {
        self.identity()
            .cloned()
            .ok_or_else(|| AppError::unauthenticated(action))
    }

    /// Apply a pending identity change without waiting.
    pub fn refresh(&mut self) -> Result<Vec<AppEvent>, AppError> {
        let identity = match self.identity_rx.as_mut() {
            Some(rx) if rx.has_changed().unwrap_or(false) => rx.borrow_and_update().clone(),
            _ => return Ok(Vec::new()),
        };
        self.machine
            .apply(SessionInput::IdentityChanged { identity })
    }

    /// Wait for the next identity change and apply it.
    ///
    /// Never resolves after dispose or once the provider has gone away.
    pub async fn next_change(&mut self) -> Result<Vec<AppEvent>, AppError> {
        let changed = match self.identity_rx.as_mut() {
            Some(rx) => rx.changed().await.is_ok(),
            None => false,
        };
        if !changed {
            self.identity_rx = None;
            return pending().await;
        }

        let identity = match self.identity_rx.as_mut() {
            Some(rx) => rx.borrow_and_update().clone(),
            None => None,
        };
        self.machine
            .apply(SessionInput::IdentityChanged { identity })
    }

    /// Unsubscribe from the provider. Terminal.
    pub fn dispose(&mut self) -> Result<Vec<AppEvent>, AppError> {
        let events = self.machine.apply(SessionInput::Dispose)?;
        self.identity_rx = None;
        debug!("auth session disposed");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::AppErrorCategory;

    struct WatchProvider {
        tx: watch::Sender<Option<UserIdentity>>,
    }

    impl WatchProvider {
        fn new(initial: Option<&str>) -> Self {
            let identity = initial.map(|id| UserIdentity::new(id).expect("valid identity"));
            Self {
                tx: watch::Sender::new(identity),
            }
        }

        fn sign_in(&self, id: &str) {
            self.tx
                .send_replace(Some(UserIdentity::new(id).expect("valid identity")));
        }
    }

    impl AuthProvider for WatchProvider {
        fn current_identity(&self) -> Option<UserIdentity> {
            self.tx.borrow().clone()
        }

        fn subscribe(&self) -> watch::Receiver<Option<UserIdentity>> {
            self.tx.subscribe()
        }

        async fn sign_out(&self) -> Result<(), AuthError> {
            self.tx.send_replace(None);
            Ok(())
        }
    }

    #[test]
    fn init_adopts_current_identity() {
        let provider = WatchProvider::new(Some("u1"));
        let (session, events) = AuthSession::init(&provider).expect("init works");

        assert_eq!(session.state(), SessionState::SignedIn);
        assert_eq!(session.identity().map(UserIdentity::as_str), Some("u1"));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn signed_out_session_requires_identity() {
        let provider = WatchProvider::new(None);
        let (session, _) = AuthSession::init(&provider).expect("init works");

        let err = session
            .require_identity("toggle_favorite")
            .expect_err("no identity");
        assert_eq!(err.category, AppErrorCategory::Unauthenticated);
    }

    #[test]
    fn refresh_picks_up_sign_in() {
        let provider = WatchProvider::new(None);
        let (mut session, _) = AuthSession::init(&provider).expect("init works");
        assert!(session.refresh().expect("nothing pending").is_empty());

        provider.sign_in("u7");
        let events = session.refresh().expect("refresh works");
        assert_eq!(events.len(), 1);
        assert_eq!(session.state(), SessionState::SignedIn);
    }

    #[tokio::test]
    async fn next_change_follows_sign_out() {
        let provider = WatchProvider::new(Some("u1"));
        let (mut session, _) = AuthSession::init(&provider).expect("init works");

        provider.sign_out().await.expect("sign out works");
        let events = session.next_change().await.expect("change applies");

        assert_eq!(
            events,
            vec![AppEvent::SessionChanged {
                state: SessionState::SignedOut,
                user_id: None,
            }]
        );
    }

    #[tokio::test]
    async fn dispose_releases_subscription() {
        let provider = WatchProvider::new(Some("u1"));
        let (mut session, _) = AuthSession::init(&provider).expect("init works");
        assert_eq!(provider.tx.receiver_count(), 1);

        session.dispose().expect("dispose works");
        assert_eq!(provider.tx.receiver_count(), 0);
        assert_eq!(session.state(), SessionState::Disposed);
        assert!(session.require_identity("anything").is_err());

        provider.sign_in("u2");
        let waited = tokio::time::timeout(Duration::from_millis(50), session.next_change()).await;
        assert!(waited.is_err(), "disposed session must not observe changes");
    }
}
