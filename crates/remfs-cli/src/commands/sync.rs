//! Sync command - Reconcile the cached view with the connector
//!
//! Provides the `remfs sync` CLI command which:
//! 1. Connects and opens the requested directory
//! 2. Runs one sync cycle (directory or full) and reports what changed
//! 3. With `--watch`, keeps syncing on the configured interval until Ctrl-C,
//!    printing change events as they arrive

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use remfs_client::{Browser, SyncOutcome};
use remfs_core::config::Config;
use remfs_core::ports::ClientEvent;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::{connect, open_or_root};
use crate::output::{get_formatter, OutputFormat, OutputFormatter};

/// Interval used by `--watch` when the config leaves it unset
const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Directory to keep in sync; the default volume root when omitted
    pub target: Option<String>,

    /// Resync the whole cache instead of the working directory
    #[arg(long)]
    pub full: bool,

    /// Keep syncing until interrupted
    #[arg(long)]
    pub watch: bool,
}

impl SyncCommand {
    pub async fn execute(&self, mut config: Config, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        if self.watch && config.sync.interval().is_none() {
            config.sync.interval_secs = DEFAULT_WATCH_INTERVAL.as_secs();
        }
        let (browser, root) = connect(config, None).await?;
        open_or_root(&browser, root, self.target.as_deref()).await?;

        let outcome = browser
            .sync(self.full)
            .outcome()
            .await
            .context("Sync failed")?;
        report(&browser, &outcome, format, &*formatter);

        if self.watch {
            self.run_watch(&browser, format, &*formatter).await;
        }
        Ok(())
    }

    async fn run_watch(
        &self,
        browser: &Browser,
        format: OutputFormat,
        formatter: &dyn OutputFormatter,
    ) {
        let (scheduler, trigger) = browser.scheduler();
        let cancel = CancellationToken::new();
        let runner = tokio::spawn(scheduler.run(cancel.clone()));
        if self.full {
            trigger.request_sync(true);
        }
        formatter.info("Watching for changes, press Ctrl-C to stop");

        let mut events = browser.subscribe();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(event) => print_event(&event, format, formatter),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        cancel.cancel();
        match runner.await {
            Ok(cycles) => info!(cycles, "Watch stopped"),
            Err(err) => warn!(error = %err, "Scheduler task failed"),
        }
    }
}

fn report(
    browser: &Browser,
    outcome: &SyncOutcome,
    format: OutputFormat,
    formatter: &dyn OutputFormatter,
) {
    let cached = browser.cache().len();
    match outcome {
        SyncOutcome::Unchanged => {
            if format.is_json() {
                formatter.print_json(&serde_json::json!({ "changed": false, "cached": cached }));
            } else {
                formatter.success("Already up to date");
            }
        }
        SyncOutcome::Applied(changes) => {
            if format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "changed": !changes.is_empty(),
                    "added": changes.added_ids(),
                    "removed": changes.removed,
                    "changed_ids": changes.changed_ids(),
                    "cached": cached,
                }));
                return;
            }
            if changes.is_empty() {
                formatter.success("Already up to date");
            } else {
                formatter.success(&format!("Synchronized {} change(s)", changes.len()));
                formatter.info(&format!("Added:   {}", changes.added.len()));
                formatter.info(&format!("Removed: {}", changes.removed.len()));
                formatter.info(&format!("Changed: {}", changes.changed.len()));
            }
        }
    }
}

fn print_event(event: &ClientEvent, format: OutputFormat, formatter: &dyn OutputFormatter) {
    let (label, ids) = match event {
        ClientEvent::EntriesAdded(ids) => ("added", ids),
        ClientEvent::EntriesRemoved(ids) => ("removed", ids),
        ClientEvent::EntriesChanged(ids) => ("changed", ids),
        ClientEvent::ErrorReported { kind, reason } => {
            formatter.warn(&format!("{kind}: {reason}"));
            return;
        }
        _ => return,
    };
    if format.is_json() {
        formatter.print_json(&serde_json::json!({ "event": label, "ids": ids }));
    } else {
        let list: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        formatter.info(&format!("{label}: {}", list.join(", ")));
    }
}
