//! Sync scheduler - periodic and on-demand sync cycles
//!
//! The [`SyncScheduler`] owns the loop that drives the
//! [`SyncEngine`](super::engine::SyncEngine). It wakes up on a fixed
//! interval, or when a [`SyncTrigger`] asks for a cycle, and syncs the
//! current working directory (or the whole cache when a full resync was
//! requested or no directory is open).
//!
//! ## Flow
//!
//! ```text
//! interval tick ──┐
//!                 ├──→ SyncScheduler ──→ SyncEngine::sync(scope)
//! SyncTrigger ────┘          │
//!                      watch::Receiver<cwd>
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use remfs_core::domain::EntryId;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{SyncEngine, SyncScope};

/// Handle for requesting a sync cycle out of schedule
#[derive(Debug, Clone)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
    full: Arc<AtomicBool>,
}

impl SyncTrigger {
    /// Requests a cycle; `full` upgrades the next cycle to a full resync
    ///
    /// Requests made while a cycle is running coalesce into one more cycle.
    pub fn request_sync(&self, full: bool) {
        if full {
            self.full.store(true, Ordering::Release);
        }
        debug!(full, "Sync requested");
        self.notify.notify_one();
    }
}

/// Drives sync cycles until cancelled
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    cwd: watch::Receiver<Option<EntryId>>,
    interval: Option<Duration>,
    notify: Arc<Notify>,
    full: Arc<AtomicBool>,
}

impl SyncScheduler {
    /// Creates a scheduler and the trigger that wakes it
    ///
    /// # Arguments
    /// * `engine` - Engine running each cycle
    /// * `cwd` - Working directory as published by the session
    /// * `interval` - Period between cycles; `None` syncs on demand only
    pub fn new(
        engine: Arc<SyncEngine>,
        cwd: watch::Receiver<Option<EntryId>>,
        interval: Option<Duration>,
    ) -> (Self, SyncTrigger) {
        let notify = Arc::new(Notify::new());
        let full = Arc::new(AtomicBool::new(false));
        let trigger = SyncTrigger {
            notify: Arc::clone(&notify),
            full: Arc::clone(&full),
        };
        let scheduler = Self {
            engine,
            cwd,
            interval,
            notify,
            full,
        };
        (scheduler, trigger)
    }

    /// Runs cycles until `cancel` fires; returns the number of cycles run
    ///
    /// Failed cycles are logged and do not stop the loop.
    pub async fn run(self, cancel: CancellationToken) -> usize {
        info!(interval_secs = self.interval.map(|d| d.as_secs()), "Sync scheduler started");
        let mut ticker = self.interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        let mut cycles = 0;
        loop {
            let full = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => self.full.swap(false, Ordering::AcqRel),
                _ = tick(&mut ticker) => false,
            };

            let cwd = self.cwd.borrow().clone();
            let scope = match (full, cwd) {
                (false, Some(dir)) => SyncScope::Directory(dir),
                (_, cwd) => SyncScope::Full { cwd },
            };

            match self.engine.sync(scope, &cancel).await {
                Ok(outcome) => debug!(changed = outcome.changed(), "Scheduled sync finished"),
                Err(err) if err.is_quiet_abort() => debug!("Scheduled sync aborted"),
                Err(err) => warn!(error = %err, "Scheduled sync failed"),
            }
            cycles += 1;
        }

        info!(cycles, "Sync scheduler stopped");
        cycles
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::testing::{dir, root, MockReply, MockTransport};
    use remfs_cache::{EntryCache, Reconciler};
    use remfs_core::config::{DispatcherConfig, SyncConfig, UploadConfig};
    use remfs_core::domain::{Command, CommandKind};
    use remfs_core::ports::{EventBus, NormalizedResponse};

    fn engine(transport: Arc<MockTransport>) -> Arc<SyncEngine> {
        let cache = Arc::new(EntryCache::new());
        let dispatcher = Dispatcher::new(
            transport,
            EventBus::default(),
            &DispatcherConfig::default(),
            &UploadConfig::default(),
        );
        Arc::new(SyncEngine::new(
            dispatcher,
            Reconciler::new(cache),
            SyncConfig::default(),
        ))
    }

    fn connector() -> Arc<MockTransport> {
        MockTransport::new(|_, _| {
            MockReply::ok(NormalizedResponse {
                cwd: Some(dir("d1", "v1")),
                files: vec![root("v1")],
                ..NormalizedResponse::default()
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_syncs_working_directory() {
        let transport = connector();
        let (_cwd_tx, cwd_rx) = watch::channel(Some(crate::testing::id("d1")));
        let (scheduler, _trigger) =
            SyncScheduler::new(engine(transport.clone()), cwd_rx, Some(Duration::from_secs(10)));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), 2);
        assert_eq!(transport.count(CommandKind::Open), 2);
        assert_eq!(transport.count(CommandKind::Parents), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_requests_full_resync() {
        let transport = connector();
        let (_cwd_tx, cwd_rx) = watch::channel(Some(crate::testing::id("d1")));
        let (scheduler, trigger) = SyncScheduler::new(engine(transport.clone()), cwd_rx, None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        trigger.request_sync(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.request_sync(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), 2);
        let opens: Vec<bool> = transport
            .requests()
            .iter()
            .filter_map(|r| match r.command {
                Command::Open { tree, .. } => Some(tree),
                _ => None,
            })
            .collect();
        assert_eq!(opens, vec![true, false]);
        assert_eq!(transport.count(CommandKind::Parents), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_working_directory_means_full_sync() {
        let transport = connector();
        let (_cwd_tx, cwd_rx) = watch::channel(None);
        let (scheduler, trigger) = SyncScheduler::new(engine(transport.clone()), cwd_rx, None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        trigger.request_sync(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(matches!(
            transport.requests()[0].command,
            Command::Open {
                target: None,
                init: true,
                tree: true,
                ..
            }
        ));
    }
}
