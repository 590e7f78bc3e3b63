//! Observer events (driving side)
//!
//! Front ends subscribe to an [`EventBus`] to learn about cache mutations,
//! sync cycles, request activity and upload progress. The bus is a thin
//! wrapper over `tokio::sync::broadcast`: emitting never blocks, and a slow
//! subscriber loses the oldest events instead of stalling the client.
//!
//! ## Ordering
//!
//! [`EventBus::publish_changes`] emits the reconciliation triple in the fixed
//! order removed, added, changed, so a moved entry is never visible twice.

use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::{ChangeSet, CommandKind, EntryId};

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// An observable client event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Entries appeared in the cache
    EntriesAdded(Vec<EntryId>),
    /// Entries left the cache
    EntriesRemoved(Vec<EntryId>),
    /// Cached entries were updated
    EntriesChanged(Vec<EntryId>),
    /// A sync cycle started for the given scope (`None` = whole tree)
    SyncStarted { scope: Option<EntryId> },
    /// A sync cycle finished; `changed` is false when nothing was mutated
    SyncFinished {
        scope: Option<EntryId>,
        changed: bool,
    },
    /// A "working" indicator should be shown for this kind of request
    RequestStarted { kind: CommandKind, message: String },
    /// The last pending request of this kind settled
    RequestFinished { kind: CommandKind },
    /// Upload progress for the current upload invocation
    UploadProgress { bytes_done: u64, total: u64 },
    /// A command failed in a way the user should see
    ErrorReported { kind: CommandKind, reason: String },
}

/// Broadcast channel for [`ClientEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Registers a new subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Emits one event; a bus without subscribers drops it
    pub fn emit(&self, event: ClientEvent) {
        trace!(?event, "Emitting client event");
        let _ = self.tx.send(event);
    }

    /// Emits the non-empty parts of a change set as removed, added, changed
    pub fn publish_changes(&self, changes: &ChangeSet) {
        if !changes.removed.is_empty() {
            self.emit(ClientEvent::EntriesRemoved(changes.removed.clone()));
        }
        if !changes.added.is_empty() {
            self.emit(ClientEvent::EntriesAdded(changes.added_ids()));
        }
        if !changes.changed.is_empty() {
            self.emit(ClientEvent::EntriesChanged(changes.changed_ids()));
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
