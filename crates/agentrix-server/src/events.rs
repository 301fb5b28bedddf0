use std::convert::Infallible;
use std::sync::Arc;

use agentrix_protocol::{RepositoryEvent, RepositorySnapshot};
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use libagentrix::automation::RepositoryEvents;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::state::AppState;

pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Fans repository updates out to every connected event stream.
#[derive(Clone)]
pub struct BroadcastRepositoryEvents {
    tx: broadcast::Sender<RepositoryEvent>,
}

impl BroadcastRepositoryEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RepositoryEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastRepositoryEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl RepositoryEvents for BroadcastRepositoryEvents {
    fn emit_repos_update(&self, snapshot: RepositorySnapshot) {
        let event = RepositoryEvent::ReposUpdate {
            repositories: snapshot,
        };
        // No subscribers is not an error.
        if let Ok(receivers) = self.tx.send(event) {
            debug!(receivers, "repos-update emitted");
        }
    }
}

fn to_sse(event: &RepositoryEvent) -> Option<Event> {
    let name = match event {
        RepositoryEvent::ReposUpdate { .. } => "repos-update",
    };
    match Event::default().event(name).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            warn!(error = %e, "failed to encode repository event");
            None
        }
    }
}

/// `GET /api/events`: server-sent `repos-update` events.
pub async fn stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = BroadcastStream::new(state.events.subscribe()).filter_map(|item| async move {
        match item {
            Ok(event) => to_sse(&event).map(Ok::<_, Infallible>),
            Err(lagged) => {
                debug!(error = %lagged, "event stream lagged");
                None
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
