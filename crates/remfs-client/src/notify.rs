//! Delayed request notifications
//!
//! A request that carries a [`NotifyPolicy`] asks the front end to show a
//! "working" indicator, but only if it is still unsettled once the delay has
//! elapsed. Fast requests never flicker an indicator.
//!
//! Indicators are aggregated per [`CommandKind`]: the first shown request of
//! a kind emits `RequestStarted`, and `RequestFinished` follows only when
//! the last shown request of that kind settles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use remfs_core::domain::CommandKind;
use remfs_core::ports::{ClientEvent, EventBus};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::dispatcher::RequestId;

/// Default delay before a pending request is announced
pub const DEFAULT_NOTIFY_DELAY: Duration = Duration::from_millis(500);

/// When and how to announce a pending request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPolicy {
    pub delay: Duration,
    pub message: String,
}

impl NotifyPolicy {
    pub fn new(delay: Duration, message: impl Into<String>) -> Self {
        Self {
            delay,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
struct Pending {
    kind: CommandKind,
    shown: bool,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct TrackerState {
    pending: HashMap<RequestId, Pending>,
    shown_per_kind: HashMap<CommandKind, usize>,
}

/// Tracks announced requests and emits start/finish events
#[derive(Debug, Clone)]
pub(crate) struct NotificationTracker {
    bus: EventBus,
    state: Arc<Mutex<TrackerState>>,
}

fn lock(state: &Mutex<TrackerState>) -> MutexGuard<'_, TrackerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NotificationTracker {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    /// Start the delay timer for a request
    pub fn begin(&self, id: RequestId, kind: CommandKind, policy: &NotifyPolicy) {
        let tracker = self.clone();
        let delay = policy.delay;
        let message = policy.message.clone();

        let mut state = lock(&self.state);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracker.show(id, message);
        });
        state.pending.insert(
            id,
            Pending {
                kind,
                shown: false,
                timer: Some(timer),
            },
        );
    }

    fn show(&self, id: RequestId, message: String) {
        let mut state = lock(&self.state);
        let Some(pending) = state.pending.get_mut(&id) else {
            return;
        };
        if pending.shown {
            return;
        }
        pending.shown = true;
        pending.timer = None;
        let kind = pending.kind;

        let count = state.shown_per_kind.entry(kind).or_insert(0);
        *count += 1;
        if *count == 1 {
            trace!(%kind, "Announcing pending request");
            self.bus.emit(ClientEvent::RequestStarted { kind, message });
        }
    }

    /// Settle a request: cancel its timer, or retire its indicator
    pub fn finish(&self, id: RequestId) {
        let mut state = lock(&self.state);
        let Some(pending) = state.pending.remove(&id) else {
            return;
        };
        if let Some(timer) = pending.timer {
            timer.abort();
        }
        if !pending.shown {
            return;
        }

        let kind = pending.kind;
        let remaining = match state.shown_per_kind.get_mut(&kind) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            state.shown_per_kind.remove(&kind);
            self.bus.emit(ClientEvent::RequestFinished { kind });
        }
    }

    /// Number of requests whose indicator is currently shown
    pub fn shown(&self, kind: CommandKind) -> usize {
        lock(&self.state)
            .shown_per_kind
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }
}
