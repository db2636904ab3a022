use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::{
    countdown::CountdownUpdate,
    error::AppError,
    normalization::error_notice,
    types::{AppCommand, AppEvent},
};

/// Receiving half handed to frontend subscribers.
pub type EventStream = broadcast::Receiver<AppEvent>;

#[derive(Debug, Error)]
pub enum ClientChannelError {
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Frontend side of a running client: commands go in, events come out.
#[derive(Clone, Debug)]
pub struct ClientChannels {
    command_tx: mpsc::Sender<AppCommand>,
    sink: EventSink,
}

impl ClientChannels {
    /// Returns the channels together with the runtime's command receiver.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<AppCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (tx, _) = broadcast::channel(event_buffer.max(1));
        (
            Self {
                command_tx,
                sink: EventSink { tx },
            },
            command_rx,
        )
    }

    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn subscribe(&self) -> EventStream {
        self.sink.tx.subscribe()
    }

    pub async fn send_command(&self, command: AppCommand) -> Result<(), ClientChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ClientChannelError::CommandChannelClosed)
    }
}

/// Emitting half of the event channel, shared by the runtime loop, countdown
/// timers and background loads.
///
/// Nothing here blocks: events sent while nobody listens are dropped, and a
/// slow subscriber sees `Lagged` instead of stalling the sender.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: broadcast::Sender<AppEvent>,
}

impl EventSink {
    pub fn emit(&self, event: AppEvent) {
        if self.tx.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = AppEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Surface a failure as a dismissable error notice.
    pub fn report(&self, error: AppError) {
        debug!(code = %error.code, category = ?error.category, "reporting failure");
        self.emit(error_notice(error));
    }

    /// Countdown callback that tags each update with its event.
    pub fn countdown_listener(
        &self,
        event_id: impl Into<String>,
    ) -> impl FnMut(CountdownUpdate) + Send + 'static {
        let sink = self.clone();
        let event_id = event_id.into();
        move |update| {
            sink.emit(AppEvent::Countdown {
                event_id: event_id.clone(),
                update,
            })
        }
    }
}
