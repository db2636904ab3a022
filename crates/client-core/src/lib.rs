//! Core client contract shared between the runtime and frontend consumers.
//!
//! This crate defines the command/event protocol, the auth session lifecycle,
//! the membership toggle protocol, countdown and retry helpers, and the
//! collaborator traits for the document store and auth provider.

/// Command channel and event sink shared by the runtime and its frontend.
pub mod channel;
/// Countdown toward an event start time.
pub mod countdown;
/// Stable client error types.
pub mod error;
/// Optimistic set-membership toggling (favorites, participation).
pub mod membership;
/// Outcome-to-event normalization helpers.
pub mod normalization;
/// Backoff policy and retry loop.
pub mod retry;
/// Explicit auth session over an auth provider.
pub mod session;
/// Auth session lifecycle state machine.
pub mod state_machine;
/// Document store contract and live subscriptions.
pub mod store;
/// Protocol and record types.
pub mod types;

pub use channel::{ClientChannelError, ClientChannels, EventSink, EventStream};
pub use countdown::{
    Clock, Countdown, CountdownBreakdown, CountdownPhase, CountdownTimer, CountdownUpdate,
    DEFAULT_TICK_PERIOD, EXPIRED_LABEL, SystemClock,
};
pub use error::{AppError, AppErrorCategory};
pub use membership::{FailurePolicy, MembershipToggle};
pub use normalization::{ToggleOutcome, error_notice, normalize_toggle_outcome};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use session::{AuthError, AuthProvider, AuthSession};
pub use state_machine::{SessionInput, SessionStateMachine};
pub use store::{DocumentStore, StoreError, Subscription};
pub use types::{
    AppCommand, AppEvent, ClientConfig, ContactKind, ContactLink, Document, DocumentPath,
    EVENTS_COLLECTION, EventRecord, FieldUpdate, MembershipAck, MembershipField, Notice,
    NoticeLevel, Role, SessionState, TODOS_COLLECTION, TodoItem, USERS_COLLECTION, UserIdentity,
    UserProfile,
};
