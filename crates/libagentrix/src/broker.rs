use std::collections::BTreeMap;

use agentrix_protocol::ServerMessage;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

pub type WatcherId = u64;

/// Default depth of each watcher's outbound queue.
pub const DEFAULT_WATCHER_QUEUE: usize = 1024;

/// Fan-out of session events to attached watchers.
///
/// Every watcher owns a bounded queue. A watcher whose queue is full or whose
/// receiver is gone is dropped on the spot; the others still get the message.
#[derive(Debug, Default)]
pub struct WatcherBroker {
    next_id: WatcherId,
    watchers: BTreeMap<WatcherId, mpsc::Sender<ServerMessage>>,
}

impl WatcherBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tx: mpsc::Sender<ServerMessage>) -> WatcherId {
        self.next_id += 1;
        let id = self.next_id;
        self.watchers.insert(id, tx);
        id
    }

    pub fn remove(&mut self, id: WatcherId) -> bool {
        self.watchers.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Deliver `message` to every watcher. Returns how many received it.
    pub fn broadcast(&mut self, message: &ServerMessage) -> usize {
        self.watchers.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(watcher_id = id, "watcher queue full, detaching");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(watcher_id = id, "watcher gone, detaching");
                false
            }
        });
        self.watchers.len()
    }

    /// Send a final message to everyone and forget them all.
    pub fn close_all(&mut self, message: &ServerMessage) -> usize {
        let delivered = self.broadcast(message);
        self.watchers.clear();
        delivered
    }
}
