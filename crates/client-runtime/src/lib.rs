use std::{future::pending, time::Duration};

use client_core::{
    AppCommand, AppError, AppErrorCategory, AppEvent, AuthProvider, AuthSession,
    ClientChannelError, ClientChannels, ClientConfig, Clock, Countdown, CountdownTimer,
    DEFAULT_TICK_PERIOD, Document, DocumentPath, DocumentStore, EVENTS_COLLECTION, EventRecord,
    EventSink, EventStream, FailurePolicy, FieldUpdate, MembershipField, MembershipToggle,
    RetryPolicy, StoreError, Subscription, SystemClock, TODOS_COLLECTION, TodoItem,
    ToggleOutcome, USERS_COLLECTION, UserIdentity, UserProfile, normalize_toggle_outcome,
    retry_with_backoff,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;

#[derive(Clone, Debug)]
pub struct ClientRuntimeHandle {
    channels: ClientChannels,
    shutdown: CancellationToken,
}

impl ClientRuntimeHandle {
    pub async fn send(&self, command: AppCommand) -> Result<(), ClientChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    /// Stop the runtime: cancels the countdown, pending retries and live
    /// subscriptions, then disposes the auth session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Spawn a runtime reading wall-clock time from the system.
pub fn spawn_runtime<S, A>(store: S, auth: A, config: ClientConfig) -> ClientRuntimeHandle
where
    S: DocumentStore + Clone + 'static,
    A: AuthProvider + 'static,
{
    spawn_runtime_with_clock(store, auth, SystemClock, config)
}

pub fn spawn_runtime_with_clock<S, A, C>(
    store: S,
    auth: A,
    clock: C,
    config: ClientConfig,
) -> ClientRuntimeHandle
where
    S: DocumentStore + Clone + 'static,
    A: AuthProvider + 'static,
    C: Clock + Clone,
{
    let (channels, command_rx) = ClientChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let shutdown = CancellationToken::new();
    let runtime = ClientRuntime::new(
        store,
        auth,
        clock,
        &config,
        channels.sink(),
        command_rx,
        shutdown.child_token(),
    );
    tokio::spawn(async move {
        runtime.run().await;
    });

    ClientRuntimeHandle { channels, shutdown }
}

/// The event currently shown: its participation view, countdown and live
/// subscription. All three are released together.
struct OpenEvent<S> {
    event_id: String,
    participation: MembershipToggle<S>,
    countdown: Option<CountdownTimer>,
    live: Option<Subscription>,
}

impl<S> OpenEvent<S> {
    async fn close(self) {
        let ticking = self
            .countdown
            .as_ref()
            .is_some_and(|countdown| !countdown.is_finished());
        if let Some(countdown) = self.countdown {
            countdown.stop().await;
        }
        debug!(event_id = %self.event_id, ticking, "event closed");
    }
}

struct Favorites<S> {
    owner: UserIdentity,
    toggle: MembershipToggle<S>,
}

enum Step {
    Shutdown,
    Command(Option<AppCommand>),
    Session(Result<Vec<AppEvent>, AppError>),
    Live(Option<Option<Document>>),
}

struct ClientRuntime<S, A, C> {
    store: S,
    auth: A,
    clock: C,
    events: EventSink,
    command_rx: mpsc::Receiver<AppCommand>,
    shutdown: CancellationToken,
    session: Option<AuthSession>,
    retry_policy: RetryPolicy,
    tick_period: Duration,
    failure_policy: FailurePolicy,
    open_event: Option<OpenEvent<S>>,
    favorites: Option<Favorites<S>>,
    users_load: Option<CancellationToken>,
}

impl<S, A, C> ClientRuntime<S, A, C>
where
    S: DocumentStore + Clone + 'static,
    A: AuthProvider + 'static,
    C: Clock + Clone,
{
    fn new(
        store: S,
        auth: A,
        clock: C,
        config: &ClientConfig,
        events: EventSink,
        command_rx: mpsc::Receiver<AppCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        let defaults = RetryPolicy::default();
        let mut retry_policy = RetryPolicy::new(
            config
                .retry_max_attempts
                .unwrap_or(defaults.max_attempts()),
            config
                .retry_initial_delay_ms
                .unwrap_or(defaults.initial_delay_ms()),
        );
        if let Some(max_delay_ms) = config.retry_max_delay_ms {
            retry_policy = retry_policy.with_max_delay_ms(max_delay_ms);
        }
        let tick_period = config
            .countdown_tick_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TICK_PERIOD);
        let failure_policy = config
            .rollback_on_failure
            .map(FailurePolicy::from_rollback_flag)
            .unwrap_or_default();

        Self {
            store,
            auth,
            clock,
            events,
            command_rx,
            shutdown,
            session: None,
            retry_policy,
            tick_period,
            failure_policy,
            open_event: None,
            favorites: None,
            users_load: None,
        }
    }

    async fn run(mut self) {
        match AuthSession::init(&self.auth) {
            Ok((session, events)) => {
                self.session = Some(session);
                self.events.emit_all(events);
            }
            Err(err) => {
                warn!(error = %err, "auth session failed to initialize");
                self.events.report(err);
                return;
            }
        }
        info!("client runtime started");

        loop {
            let step = {
                let session = self.session.as_mut();
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => Step::Shutdown,
                    command = self.command_rx.recv() => Step::Command(command),
                    change = next_session_change(session) => Step::Session(change),
                    update = next_live_update(&mut self.open_event) => Step::Live(update),
                }
            };

            match step {
                Step::Shutdown | Step::Command(None) => break,
                Step::Command(Some(command)) => {
                    if let Err(err) = self.handle_command(command).await {
                        self.events.report(err);
                    }
                }
                Step::Session(result) => match result {
                    Ok(events) => self.apply_session_events(events),
                    Err(err) => self.events.report(err),
                },
                Step::Live(update) => self.handle_live_update(update).await,
            }
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, command: AppCommand) -> Result<(), AppError> {
        match command {
            AppCommand::OpenEvent { event_id } => self.handle_open_event(event_id).await,
            AppCommand::CloseEvent => {
                self.close_open_event().await;
                Ok(())
            }
            AppCommand::ToggleParticipation => self.handle_toggle_participation().await,
            AppCommand::LoadFavorites => self.handle_load_favorites().await,
            AppCommand::ToggleFavorite { image_url } => {
                self.handle_toggle_favorite(image_url).await;
                Ok(())
            }
            AppCommand::LoadUsers => self.handle_load_users(),
            AppCommand::CreateEvent { event } => self.handle_create_event(event).await,
            AppCommand::DeleteEvent { event_id } => self.handle_delete_event(event_id).await,
            AppCommand::SuspendUser { user_id } => self.handle_suspend_user(user_id).await,
            AppCommand::DeleteUser { user_id } => self.handle_delete_user(user_id).await,
            AppCommand::LoadTodos => self.handle_load_todos().await,
            AppCommand::AddTodo { name, date, time } => {
                self.handle_add_todo(name, date, time).await
            }
            AppCommand::DeleteTodo { todo_id } => self.handle_delete_todo(todo_id).await,
            AppCommand::SignOut => self.handle_sign_out().await,
        }
    }

    async fn handle_open_event(&mut self, event_id: String) -> Result<(), AppError> {
        if event_id.trim().is_empty() {
            return Err(AppError::invalid_argument("event id must not be empty"));
        }
        self.close_open_event().await;

        let path = DocumentPath::event(event_id.as_str());
        let document = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| AppError::from(StoreError::NotFound(path.to_string())))?;
        let event = EventRecord::from_document(event_id.as_str(), &document)?;

        let participation = MembershipToggle::participation(
            self.store.clone(),
            event_id.as_str(),
            self.failure_policy,
        );
        participation.seed(event.participants.iter().cloned());
        let participating = self
            .identity()
            .is_some_and(|identity| participation.is_member(identity.as_str()));

        let countdown_phase = event
            .starts_at_ms
            .map(|target_ms| Countdown::new(target_ms, self.clock.now_ms()).phase());
        let countdown = event.starts_at_ms.map(|target_ms| {
            CountdownTimer::spawn(
                target_ms,
                self.clock.clone(),
                self.tick_period,
                self.events.countdown_listener(event_id.as_str()),
            )
        });
        let live = match self.store.subscribe(&path) {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(%path, error = %err, "live updates unavailable");
                None
            }
        };

        info!(%event_id, participating, "event opened");
        self.open_event = Some(OpenEvent {
            event_id,
            participation,
            countdown,
            live,
        });
        self.events.emit(AppEvent::EventOpened {
            event,
            participating,
            countdown: countdown_phase,
        });
        Ok(())
    }

    async fn close_open_event(&mut self) {
        if let Some(open) = self.open_event.take() {
            let event_id = open.event_id.clone();
            open.close().await;
            self.events.emit(AppEvent::EventClosed { event_id });
        }
    }

    async fn handle_live_update(&mut self, update: Option<Option<Document>>) {
        let Some(open) = self.open_event.as_mut() else {
            return;
        };
        match update {
            Some(Some(document)) => match EventRecord::from_document(&open.event_id, &document) {
                Ok(event) => {
                    open.participation.resync(event.participants.iter().cloned());
                    self.events.emit(AppEvent::EventUpdated { event });
                }
                Err(err) => self.events.report(err),
            },
            Some(None) => {
                debug!(event_id = %open.event_id, "open event was deleted remotely");
                self.close_open_event().await;
            }
            None => {
                warn!(event_id = %open.event_id, "live subscription ended");
                open.live = None;
            }
        }
    }

    async fn handle_toggle_participation(&mut self) -> Result<(), AppError> {
        let identity = self.identity().cloned();
        let Some(open) = self.open_event.as_ref() else {
            return Err(AppError::invalid_argument("no event is open"));
        };

        let element = identity
            .as_ref()
            .map(|identity| identity.as_str().to_owned())
            .unwrap_or_default();
        let outcome = match open.participation.toggle_self(identity.as_ref()).await {
            Ok(member) => ToggleOutcome::Applied { member },
            Err(error) => ToggleOutcome::Failed {
                member: open.participation.is_member(&element),
                error,
            },
        };

        self.events.emit(normalize_toggle_outcome(
            MembershipField::Participants,
            element,
            outcome,
        ));
        Ok(())
    }

    async fn handle_load_favorites(&mut self) -> Result<(), AppError> {
        let identity = self.require_identity("load_favorites")?;
        let toggle = self.reload_favorites(identity).await?;
        self.events.emit(AppEvent::FavoritesLoaded {
            urls: toggle.members(),
        });
        Ok(())
    }

    async fn handle_toggle_favorite(&mut self, image_url: String) {
        let result = self.toggle_favorite(&image_url).await;
        let outcome = match result {
            Ok(member) => ToggleOutcome::Applied { member },
            Err(error) => ToggleOutcome::Failed {
                member: self
                    .favorites
                    .as_ref()
                    .is_some_and(|favorites| favorites.toggle.is_member(&image_url)),
                error,
            },
        };
        self.events.emit(normalize_toggle_outcome(
            MembershipField::Favorites,
            image_url,
            outcome,
        ));
    }

    async fn toggle_favorite(&mut self, image_url: &str) -> Result<bool, AppError> {
        let identity = self.require_identity("toggle_favorite")?;
        let cached = self
            .favorites
            .as_ref()
            .filter(|favorites| favorites.owner == identity)
            .map(|favorites| favorites.toggle.clone());
        let toggle = match cached {
            Some(toggle) => toggle,
            // Let the toggle report the invalid element without a remote read.
            None if image_url.trim().is_empty() => {
                MembershipToggle::favorites(self.store.clone(), self.failure_policy)
            }
            None => self.reload_favorites(identity.clone()).await?,
        };
        toggle.toggle(Some(&identity), image_url).await
    }

    async fn reload_favorites(
        &mut self,
        identity: UserIdentity,
    ) -> Result<MembershipToggle<S>, AppError> {
        let profile = self.load_profile(&identity).await?;
        let toggle = MembershipToggle::favorites(self.store.clone(), self.failure_policy);
        toggle.seed(profile.favorites);
        self.favorites = Some(Favorites {
            owner: identity,
            toggle: toggle.clone(),
        });
        Ok(toggle)
    }

    fn handle_load_users(&mut self) -> Result<(), AppError> {
        self.require_identity("load_users")?;
        if let Some(previous) = self.users_load.take() {
            previous.cancel();
        }

        let cancel = self.shutdown.child_token();
        self.users_load = Some(cancel.clone());
        let store = self.store.clone();
        let policy = self.retry_policy;
        let events = self.events.clone();
        debug!(
            attempts = policy.max_attempts(),
            max_backoff = ?policy.worst_case_backoff(),
            "loading users"
        );

        tokio::spawn(async move {
            let result = retry_with_backoff(&policy, &cancel, "load_users", || {
                let store = store.clone();
                async move { load_users(&store).await }
            })
            .await;

            let event = match result {
                Ok(users) => {
                    debug!(count = users.len(), "users loaded");
                    AppEvent::UsersLoaded { users }
                }
                Err(err) if cancel.is_cancelled() => {
                    debug!(code = %err.code, "user load abandoned");
                    return;
                }
                Err(err) => {
                    events.report(err);
                    return;
                }
            };
            events.emit(event);
        });
        Ok(())
    }

    async fn handle_create_event(&mut self, event: EventRecord) -> Result<(), AppError> {
        self.require_admin("create_event").await?;
        if event.title.trim().is_empty() {
            return Err(AppError::invalid_argument("event title must not be empty"));
        }

        let document = event.to_document()?;
        let event_id = self.store.add(EVENTS_COLLECTION, document).await?;
        info!(%event_id, "event created");
        self.events.emit(AppEvent::EventCreated { event_id });
        Ok(())
    }

    async fn handle_delete_event(&mut self, event_id: String) -> Result<(), AppError> {
        self.require_admin("delete_event").await?;

        self.store.delete(&DocumentPath::event(event_id.as_str())).await?;
        if self
            .open_event
            .as_ref()
            .is_some_and(|open| open.event_id == event_id)
        {
            self.close_open_event().await;
        }
        info!(%event_id, "event deleted");
        self.events.emit(AppEvent::EventDeleted { event_id });
        Ok(())
    }

    async fn handle_suspend_user(&mut self, user_id: String) -> Result<(), AppError> {
        self.require_admin("suspend_user").await?;
        if user_id.trim().is_empty() {
            return Err(AppError::invalid_argument("user id must not be empty"));
        }

        let suspend = FieldUpdate::Set {
            field: "isSuspended".to_owned(),
            value: Value::Bool(true),
        };
        self.store
            .update(&DocumentPath::user(user_id.as_str()), vec![suspend])
            .await?;
        info!(%user_id, "user suspended");
        self.events.emit(AppEvent::UserSuspended { user_id });
        Ok(())
    }

    async fn handle_delete_user(&mut self, user_id: String) -> Result<(), AppError> {
        let admin = self.require_admin("delete_user").await?;
        if user_id.trim().is_empty() {
            return Err(AppError::invalid_argument("user id must not be empty"));
        }
        if admin.as_str() == user_id {
            return Err(AppError::invalid_argument(
                "administrators cannot delete their own profile",
            ));
        }

        self.store
            .delete(&DocumentPath::user(user_id.as_str()))
            .await?;
        info!(%user_id, "user deleted");
        self.events.emit(AppEvent::UserDeleted { user_id });
        Ok(())
    }

    async fn handle_load_todos(&mut self) -> Result<(), AppError> {
        let identity = self.require_identity("load_todos")?;
        let mut todos = self
            .store
            .list(TODOS_COLLECTION)
            .await?
            .iter()
            .filter(|(_, document)| {
                document.get("userId").and_then(Value::as_str) == Some(identity.as_str())
            })
            .map(|(id, document)| TodoItem::from_document(id.as_str(), document))
            .collect::<Result<Vec<_>, _>>()?;
        todos.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });

        debug!(count = todos.len(), "to-do entries loaded");
        self.events.emit(AppEvent::TodosLoaded { todos });
        Ok(())
    }

    async fn handle_add_todo(
        &mut self,
        name: String,
        date: Option<String>,
        time: Option<String>,
    ) -> Result<(), AppError> {
        let identity = self.require_identity("add_todo")?;
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::invalid_argument("to-do name must not be empty"));
        }

        let mut todo = TodoItem {
            id: String::new(),
            user_id: identity.as_str().to_owned(),
            name: name.to_owned(),
            date,
            time,
            created_at_ms: Some(self.clock.now_ms()),
        };
        todo.id = self.store.add(TODOS_COLLECTION, todo.to_document()?).await?;
        debug!(todo_id = %todo.id, "to-do entry added");
        self.events.emit(AppEvent::TodoAdded { todo });
        Ok(())
    }

    async fn handle_delete_todo(&mut self, todo_id: String) -> Result<(), AppError> {
        let identity = self.require_identity("delete_todo")?;
        let path = DocumentPath::todo(todo_id.as_str());
        let document = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| AppError::from(StoreError::NotFound(path.to_string())))?;
        let todo = TodoItem::from_document(todo_id.as_str(), &document)?;
        if todo.user_id != identity.as_str() {
            warn!(user_id = %identity, %todo_id, "refusing to delete foreign to-do entry");
            return Err(AppError::new(
                AppErrorCategory::Forbidden,
                "forbidden",
                "to-do entry belongs to another user",
            ));
        }

        self.store.delete(&path).await?;
        debug!(%todo_id, "to-do entry deleted");
        self.events.emit(AppEvent::TodoDeleted { todo_id });
        Ok(())
    }

    async fn handle_sign_out(&mut self) -> Result<(), AppError> {
        self.require_identity("sign_out")?;
        self.auth.sign_out().await?;

        let events = match self.session.as_mut() {
            Some(session) => session.refresh()?,
            None => Vec::new(),
        };
        self.apply_session_events(events);
        Ok(())
    }

    fn apply_session_events(&mut self, events: Vec<AppEvent>) {
        let identity = self.identity().cloned();
        if self
            .favorites
            .as_ref()
            .is_some_and(|favorites| Some(&favorites.owner) != identity.as_ref())
        {
            self.favorites = None;
        }
        if identity.is_none()
            && let Some(cancel) = self.users_load.take()
        {
            cancel.cancel();
        }
        self.events.emit_all(events);
    }

    async fn teardown(&mut self) {
        if let Some(cancel) = self.users_load.take() {
            cancel.cancel();
        }
        self.close_open_event().await;
        self.favorites = None;

        if let Some(session) = self.session.as_mut() {
            match session.dispose() {
                Ok(events) => self.events.emit_all(events),
                Err(err) => warn!(error = %err, "auth session dispose failed"),
            }
        }
        info!("client runtime stopped");
    }

    async fn require_admin(&self, action: &str) -> Result<UserIdentity, AppError> {
        let identity = self.require_identity(action)?;
        let profile = self.load_profile(&identity).await?;
        if !profile.role.is_admin() {
            warn!(user_id = %identity, action, "admin action refused");
            return Err(AppError::forbidden(action));
        }
        Ok(identity)
    }

    async fn load_profile(&self, identity: &UserIdentity) -> Result<UserProfile, AppError> {
        let document = self.store.get(&DocumentPath::user(identity.as_str())).await?;
        match document {
            Some(document) => UserProfile::from_document(identity.as_str(), &document),
            None => Ok(UserProfile {
                id: identity.as_str().to_owned(),
                ..UserProfile::default()
            }),
        }
    }

    fn identity(&self) -> Option<&UserIdentity> {
        self.session.as_ref().and_then(AuthSession::identity)
    }

    fn require_identity(&self, action: &str) -> Result<UserIdentity, AppError> {
        match self.session.as_ref() {
            Some(session) => session.require_identity(action),
            None => Err(AppError::unauthenticated(action)),
        }
    }

}

async fn next_session_change(
    session: Option<&mut AuthSession>,
) -> Result<Vec<AppEvent>, AppError> {
    match session {
        Some(session) => session.next_change().await,
        None => pending().await,
    }
}

async fn next_live_update<S>(open: &mut Option<OpenEvent<S>>) -> Option<Option<Document>> {
    match open.as_mut().and_then(|open| open.live.as_mut()) {
        Some(live) => live.changed().await,
        None => pending().await,
    }
}

async fn load_users<S: DocumentStore>(store: &S) -> Result<Vec<UserProfile>, AppError> {
    store
        .list(USERS_COLLECTION)
        .await?
        .iter()
        .map(|(id, document)| UserProfile::from_document(id.as_str(), document))
        .collect()
}
