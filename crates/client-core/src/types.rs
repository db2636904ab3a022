use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{countdown::CountdownPhase, countdown::CountdownUpdate, error::AppError};

/// Collection holding one profile document per user.
pub const USERS_COLLECTION: &str = "users";
/// Collection holding event documents.
pub const EVENTS_COLLECTION: &str = "events";
/// Collection holding personal to-do entries of every user.
pub const TODOS_COLLECTION: &str = "todoList";

/// A remote document body.
pub type Document = serde_json::Map<String, Value>;

/// Opaque, non-empty user identifier issued by the authentication provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserIdentity(String);

impl UserIdentity {
    pub fn new(value: impl Into<String>) -> Result<Self, AppError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::invalid_argument("user identity must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserIdentity {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserIdentity> for String {
    fn from(value: UserIdentity) -> Self {
        value.0
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Account role.
///
/// Profiles store the role as a boolean (`true` for an ordinary user, `false`
/// for an administrator). That encoding is only ever read or written through
/// [`Role::from_legacy_flag`] and [`Role::legacy_flag`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn from_legacy_flag(is_user: bool) -> Self {
        if is_user { Self::User } else { Self::Admin }
    }

    pub fn legacy_flag(self) -> bool {
        matches!(self, Self::User)
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

mod legacy_role {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Role;

    pub fn serialize<S: Serializer>(role: &Role, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(role.legacy_flag())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Role, D::Error> {
        Ok(Option::<bool>::deserialize(deserializer)?
            .map(Role::from_legacy_flag)
            .unwrap_or_default())
    }
}

/// Accepts either a single string or a list of strings.
fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

/// Instants stored as RFC 3339 text, e.g. `2025-06-01T18:00:00.000Z`.
///
/// Bare epoch milliseconds are accepted on read. Null and blank text read as
/// no instant.
mod instant_ms {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _, ser::Error as _};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Stored {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        let Some(ms) = *value else {
            return serializer.serialize_none();
        };
        let at = i64::try_from(ms)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| S::Error::custom(format!("instant out of range: {ms}")))?;
        serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        match Option::<Stored>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Stored::Millis(ms)) => Ok(Some(ms)),
            Some(Stored::Text(text)) if text.trim().is_empty() => Ok(None),
            Some(Stored::Text(text)) => {
                let at = DateTime::parse_from_rfc3339(text.trim()).map_err(|err| {
                    D::Error::custom(format!("invalid instant '{text}': {err}"))
                })?;
                u64::try_from(at.timestamp_millis())
                    .map(Some)
                    .map_err(|_| D::Error::custom(format!("instant before 1970: '{text}'")))
            }
        }
    }
}

/// `(collection, document id)` address of a remote document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentPath {
    pub collection: String,
    pub id: String,
}

impl DocumentPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self::new(USERS_COLLECTION, user_id)
    }

    pub fn event(event_id: impl Into<String>) -> Self {
        Self::new(EVENTS_COLLECTION, event_id)
    }

    pub fn todo(todo_id: impl Into<String>) -> Self {
        Self::new(TODOS_COLLECTION, todo_id)
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Field-level mutation applied atomically to a single document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FieldUpdate {
    /// Overwrite one field.
    Set { field: String, value: Value },
    /// Add elements to a set-valued field; present elements are left alone.
    ArrayUnion { field: String, elements: Vec<String> },
    /// Remove elements from a set-valued field; absent elements are ignored.
    ArrayRemove { field: String, elements: Vec<String> },
}

impl FieldUpdate {
    pub fn field(&self) -> &str {
        match self {
            Self::Set { field, .. }
            | Self::ArrayUnion { field, .. }
            | Self::ArrayRemove { field, .. } => field,
        }
    }
}

/// Set-valued fields mutated through the membership toggle protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MembershipField {
    /// Image URLs on `users/{id}`.
    Favorites,
    /// User ids on `events/{id}`.
    Participants,
}

impl MembershipField {
    pub fn field_name(self) -> &'static str {
        match self {
            Self::Favorites => "favorites",
            Self::Participants => "participants",
        }
    }
}

/// Event record as stored under `events/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Document id; not part of the stored body.
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Start time in milliseconds since Unix epoch, stored as RFC 3339 text.
    #[serde(
        default,
        rename = "dateTime",
        with = "instant_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub starts_at_ms: Option<u64>,
    /// Single cover image used when `images` is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub images: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub rules: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub contact_info: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub participants: Vec<String>,
}

impl EventRecord {
    pub fn from_document(id: impl Into<String>, document: &Document) -> Result<Self, AppError> {
        let mut record: Self = serde_json::from_value(Value::Object(document.clone()))?;
        record.id = id.into();
        Ok(record)
    }

    pub fn to_document(&self) -> Result<Document, AppError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(AppError::serialization(format!(
                "event record encoded as non-object: {other}"
            ))),
        }
    }

    /// Images to display, falling back to the single cover image.
    pub fn gallery(&self) -> Vec<&str> {
        if self.images.is_empty() {
            self.image.as_deref().into_iter().collect()
        } else {
            self.images.iter().map(String::as_str).collect()
        }
    }

    pub fn contacts(&self) -> Vec<ContactLink> {
        self.contact_info
            .iter()
            .map(|value| ContactLink::classify(value))
            .collect()
    }
}

/// How a contact entry should be opened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContactKind {
    Email,
    Phone,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactLink {
    pub kind: ContactKind,
    pub value: String,
}

impl ContactLink {
    /// Entries containing `@` are e-mail addresses, everything else is a phone number.
    pub fn classify(value: &str) -> Self {
        let kind = if value.contains('@') {
            ContactKind::Email
        } else {
            ContactKind::Phone
        };
        Self {
            kind,
            value: value.to_owned(),
        }
    }

    pub fn href(&self) -> String {
        match self.kind {
            ContactKind::Email => format!("mailto:{}", self.value),
            ContactKind::Phone => format!("tel:{}", self.value),
        }
    }
}

/// Profile record as stored under `users/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, with = "legacy_role")]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub favorites: Vec<String>,
    #[serde(default)]
    pub is_suspended: bool,
}

impl UserProfile {
    pub fn from_document(id: impl Into<String>, document: &Document) -> Result<Self, AppError> {
        let mut profile: Self = serde_json::from_value(Value::Object(document.clone()))?;
        profile.id = id.into();
        Ok(profile)
    }
}

/// Personal to-do entry under `todoList/{id}`, owned through `userId`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    /// Display date as entered by the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Creation instant; listings are newest first.
    #[serde(
        default,
        rename = "timestamp",
        with = "instant_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at_ms: Option<u64>,
}

impl TodoItem {
    pub fn from_document(id: impl Into<String>, document: &Document) -> Result<Self, AppError> {
        let mut item: Self = serde_json::from_value(Value::Object(document.clone()))?;
        item.id = id.into();
        Ok(item)
    }

    pub fn to_document(&self) -> Result<Document, AppError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(AppError::serialization(format!(
                "to-do entry encoded as non-object: {other}"
            ))),
        }
    }
}

/// Lifecycle of an [`AuthSession`](crate::session::AuthSession).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    /// Not yet subscribed to the auth provider.
    Cold,
    /// Subscribed; no identity present.
    SignedOut,
    /// Subscribed; an identity is present.
    SignedIn,
    /// Unsubscribed; terminal.
    Disposed,
}

/// Optional runtime tuning values; `None` keeps the built-in default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClientConfig {
    pub retry_max_attempts: Option<u32>,
    pub retry_initial_delay_ms: Option<u64>,
    /// Upper bound on a single backoff wait.
    pub retry_max_delay_ms: Option<u64>,
    pub countdown_tick_ms: Option<u64>,
    /// Roll local membership state back when the remote write fails.
    pub rollback_on_failure: Option<bool>,
}

/// Command channel input accepted by the client runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppCommand {
    /// Load an event, seed participation and start its countdown.
    OpenEvent { event_id: String },
    /// Tear down the open event (countdown and live subscription).
    CloseEvent,
    /// Flip the signed-in user's participation in the open event.
    ToggleParticipation,
    /// Load the signed-in user's favorites.
    LoadFavorites,
    /// Flip one image URL in the signed-in user's favorites.
    ToggleFavorite { image_url: String },
    /// Load every user profile, retrying with backoff.
    LoadUsers,
    /// Create an event (admin only).
    CreateEvent { event: EventRecord },
    /// Delete an event (admin only).
    DeleteEvent { event_id: String },
    /// Mark a user account as suspended (admin only).
    SuspendUser { user_id: String },
    /// Delete a user profile (admin only).
    DeleteUser { user_id: String },
    /// Load the signed-in user's to-do entries, newest first.
    LoadTodos,
    /// Add a to-do entry owned by the signed-in user.
    AddTodo {
        name: String,
        date: Option<String>,
        time: Option<String>,
    },
    /// Delete one of the signed-in user's to-do entries.
    DeleteTodo { todo_id: String },
    /// Sign the current user out through the auth provider.
    SignOut,
}

/// Acknowledgement for a membership toggle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipAck {
    pub field: MembershipField,
    pub element: String,
    /// Local membership flag after the toggle settled.
    pub member: bool,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Dismissable message for the user. Never fatal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub code: String,
    pub message: String,
    /// Whether retrying the same action may succeed.
    pub retryable: bool,
}

/// Event channel output emitted by the client runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppEvent {
    SessionChanged {
        state: SessionState,
        user_id: Option<String>,
    },
    EventOpened {
        event: EventRecord,
        participating: bool,
        /// `None` when the event has no start time.
        countdown: Option<CountdownPhase>,
    },
    /// Live update of the open event record.
    EventUpdated { event: EventRecord },
    EventClosed { event_id: String },
    Countdown {
        event_id: String,
        update: CountdownUpdate,
    },
    MembershipAck(MembershipAck),
    FavoritesLoaded { urls: Vec<String> },
    UsersLoaded { users: Vec<UserProfile> },
    EventCreated { event_id: String },
    EventDeleted { event_id: String },
    UserSuspended { user_id: String },
    UserDeleted { user_id: String },
    TodosLoaded { todos: Vec<TodoItem> },
    TodoAdded { todo: TodoItem },
    TodoDeleted { todo_id: String },
    Notice(Notice),
}
