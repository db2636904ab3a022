use crate::{
    error::AppError,
    types::{AppEvent, SessionState, UserIdentity},
};

/// Inputs driving the auth session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    /// Subscribed to the auth provider with its current identity.
    Init { identity: Option<UserIdentity> },
    /// The auth provider reported a new identity (or none).
    IdentityChanged { identity: Option<UserIdentity> },
    /// Unsubscribed from the auth provider.
    Dispose,
}

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
    identity: Option<UserIdentity>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            state: SessionState::Cold,
            identity: None,
        }
    }
}

impl SessionStateMachine {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&UserIdentity> {
        self.identity.as_ref()
    }

    pub fn apply(&mut self, input: SessionInput) -> Result<Vec<AppEvent>, AppError> {
        match input {
            SessionInput::Init { identity } => {
                if self.state != SessionState::Cold {
                    return Err(AppError::invalid_state(self.state, "init"));
                }
                Ok(self.enter(identity))
            }
            SessionInput::IdentityChanged { identity } => {
                if !self.is_subscribed() {
                    return Err(AppError::invalid_state(self.state, "identity_changed"));
                }
                if identity == self.identity {
                    return Ok(Vec::new());
                }
                Ok(self.enter(identity))
            }
            SessionInput::Dispose => {
                if self.state == SessionState::Disposed {
                    return Err(AppError::invalid_state(self.state, "dispose"));
                }
                self.state = SessionState::Disposed;
                self.identity = None;
                Ok(vec![self.changed_event()])
            }
        }
    }

    fn is_subscribed(&self) -> bool {
        matches!(
            self.state,
            SessionState::SignedIn | SessionState::SignedOut
        )
    }

    fn enter(&mut self, identity: Option<UserIdentity>) -> Vec<AppEvent> {
        self.state = if identity.is_some() {
            SessionState::SignedIn
        } else {
            SessionState::SignedOut
        };
        self.identity = identity;
        vec![self.changed_event()]
    }

    fn changed_event(&self) -> AppEvent {
        AppEvent::SessionChanged {
            state: self.state,
            user_id: self.identity.as_ref().map(|id| id.as_str().to_owned()),
        }
    }
}
