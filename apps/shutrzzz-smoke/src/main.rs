mod config;
mod logging;

use std::{process, time::Duration};

use client_core::{
    AppCommand, AppError, AppEvent, Clock, CountdownPhase, CountdownUpdate, Document,
    DocumentPath, DocumentStore, EventRecord, SessionState, SystemClock,
};
use client_platform::{InMemoryAuthProvider, InMemoryDocumentStore};
use client_runtime::spawn_runtime;
use config::SmokeConfig;
use serde_json::{Value, json};
use tokio::{sync::broadcast::error::RecvError, time::timeout};
use tracing::{error, info, warn};

const DEMO_EVENT_ID: &str = "demo-event";
const DEMO_IMAGE: &str = "https://images.example.org/golden-hour.jpg";
const SESSION_GRACE: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(2);
        }
    };

    let store = InMemoryDocumentStore::new();
    if let Err(err) = seed(&store, &config).await {
        eprintln!("Failed to seed demo data: {err}");
        process::exit(1);
    }

    if let Err(err) = run_session(store, config).await {
        error!(%err, "smoke session failed");
        process::exit(1);
    }
}

async fn seed(store: &InMemoryDocumentStore, config: &SmokeConfig) -> Result<(), AppError> {
    let starts_at_ms = SystemClock
        .now_ms()
        .saturating_add(config.event_lead_secs.saturating_mul(1_000));
    let demo_event = EventRecord {
        title: "Golden hour walk".to_owned(),
        description: "Bring a wide lens.".to_owned(),
        location: Some("Harbour steps".to_owned()),
        starts_at_ms: Some(starts_at_ms),
        image: Some(DEMO_IMAGE.to_owned()),
        rules: vec!["No flash photography".to_owned()],
        contact_info: vec!["host@example.org".to_owned(), "+1 555 0100".to_owned()],
        ..EventRecord::default()
    };

    store
        .set(
            &DocumentPath::user(config.user.as_str()),
            object(json!({
                "name": "Demo Photographer",
                "email": "demo@example.org",
                "role": true,
                "favorites": [],
            })),
        )
        .await?;
    store
        .set(
            &DocumentPath::user("admin"),
            object(json!({ "name": "Admin", "email": "admin@example.org", "role": false })),
        )
        .await?;
    store
        .set(&DocumentPath::event(DEMO_EVENT_ID), demo_event.to_document()?)
        .await?;
    Ok(())
}

async fn run_session(store: InMemoryDocumentStore, config: SmokeConfig) -> Result<(), String> {
    let auth = InMemoryAuthProvider::new(Some(config.user.clone()));
    let handle = spawn_runtime(store.clone(), auth, config.client.clone());
    let mut events = handle.subscribe();

    let script = [
        AppCommand::OpenEvent {
            event_id: DEMO_EVENT_ID.to_owned(),
        },
        AppCommand::ToggleParticipation,
        AppCommand::ToggleFavorite {
            image_url: DEMO_IMAGE.to_owned(),
        },
        AppCommand::ToggleFavorite {
            image_url: String::new(),
        },
        AppCommand::LoadFavorites,
        AppCommand::AddTodo {
            name: "Charge camera batteries".to_owned(),
            date: None,
            time: None,
        },
        AppCommand::LoadTodos,
        AppCommand::CreateEvent {
            event: Default::default(),
        },
    ];
    for command in script {
        handle.send(command).await.map_err(|err| err.to_string())?;
    }

    let mut users_requested = false;
    let mut users_loaded = false;
    let mut countdown_done = false;
    let mut shutting_down = false;

    loop {
        let event = match timeout(SESSION_GRACE, events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "event stream lagged");
                continue;
            }
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => return Err("timed out waiting for runtime events".to_owned()),
        };

        match &event {
            AppEvent::EventOpened {
                event, countdown, ..
            } => {
                info!(
                    title = %event.title,
                    gallery = ?event.gallery(),
                    contacts = ?event.contacts().iter().map(|c| c.href()).collect::<Vec<_>>(),
                    countdown = ?countdown,
                    "event opened"
                );
                countdown_done = *countdown != Some(CountdownPhase::Running);
            }
            AppEvent::Countdown { update, .. } => {
                info!(label = %update.label(), "countdown");
                countdown_done = matches!(update, CountdownUpdate::Expired);
            }
            AppEvent::UsersLoaded { users } => {
                info!(count = users.len(), "users loaded");
                users_loaded = true;
            }
            AppEvent::SessionChanged { state, user_id } => {
                info!(?state, user_id = ?user_id, "session changed");
                match state {
                    SessionState::SignedOut if shutting_down => handle.shutdown(),
                    SessionState::Disposed => break,
                    _ => {}
                }
            }
            // The non-admin create is the last scripted command to settle.
            AppEvent::Notice(notice) if notice.code == "forbidden" && !users_requested => {
                info!(code = %notice.code, "create refused for non-admin");
                users_requested = true;
                // Exercise the backoff path: the first two list calls fail.
                store.fail_next_calls(2);
                handle
                    .send(AppCommand::LoadUsers)
                    .await
                    .map_err(|err| err.to_string())?;
            }
            other => info!(event = ?other, "runtime event"),
        }

        if users_loaded && countdown_done && !shutting_down {
            shutting_down = true;
            handle
                .send(AppCommand::SignOut)
                .await
                .map_err(|err| err.to_string())?;
        }
    }

    let participants = store
        .get(&DocumentPath::event(DEMO_EVENT_ID))
        .await
        .map_err(|err| err.to_string())?
        .and_then(|document| document.get("participants").cloned());
    info!(participants = ?participants, "final event participants");
    Ok(())
}

fn object(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
