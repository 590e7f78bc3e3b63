//! Upload command - send local files to a connector directory
//!
//! Files are read fully into memory, then handed to the upload pipeline
//! which batches small files, chunks large ones and commits the result.
//! A directory argument is uploaded with its tree, recreating its
//! subdirectories below the destination.
//! Ctrl-C cancels every in-flight request of the upload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use remfs_client::{FolderItem, UploadReport};
use remfs_core::config::Config;
use remfs_core::domain::UploadFile;
use remfs_core::ports::{ClientEvent, ConflictAction, FixedResolver, IConflictResolver};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::context::{connect, open_or_root};
use crate::output::{entry_line, get_formatter, human_size, OutputFormat, OutputFormatter};

/// Answer given to every name collision
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OnConflict {
    Skip,
    Overwrite,
    Rename,
}

impl From<OnConflict> for ConflictAction {
    fn from(value: OnConflict) -> Self {
        match value {
            OnConflict::Skip => ConflictAction::Skip,
            OnConflict::Overwrite => ConflictAction::Overwrite,
            OnConflict::Rename => ConflictAction::Rename,
        }
    }
}

#[derive(Debug, Args)]
pub struct UploadCommand {
    /// Local files or directories to upload
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Destination directory id; the default volume root when omitted
    #[arg(long)]
    pub target: Option<String>,

    /// What to do when a name already exists; fails on collisions when omitted
    #[arg(long, value_enum)]
    pub on_conflict: Option<OnConflict>,
}

impl UploadCommand {
    pub async fn execute(&self, config: Config, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let items = self.read_items().await?;
        let total: u64 = items.iter().map(|item| item.file.data.len() as u64).sum();

        let resolver = self
            .on_conflict
            .map(|choice| Arc::new(FixedResolver(choice.into())) as Arc<dyn IConflictResolver>);
        let (browser, root) = connect(config, resolver).await?;
        let target = open_or_root(&browser, root, self.target.as_deref()).await?;

        info!(%target, files = items.len(), total, "Starting upload");
        let progress = (!format.is_json()).then(|| tokio::spawn(show_progress(browser.subscribe())));

        let operation = browser.upload_folder(items, target);
        let cancel = operation.cancel_token().clone();
        let report = tokio::select! {
            result = operation.outcome() => result.context("Upload failed")?,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                formatter.warn("Interrupted, upload cancelled");
                return Ok(());
            }
        };
        if let Some(progress) = progress {
            progress.abort();
        }

        print_report(&report, total, format, &*formatter)
    }

    async fn read_items(&self) -> Result<Vec<FolderItem>> {
        let mut items = Vec::with_capacity(self.files.len());
        for path in &self.files {
            let name = file_name(path)?;
            let metadata = tokio::fs::metadata(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if metadata.is_dir() {
                read_tree(path, vec![name], &mut items).await?;
            } else {
                items.push(FolderItem::flat(read_file(path, name).await?));
            }
        }
        Ok(items)
    }
}

fn file_name(path: &Path) -> Result<String> {
    Ok(path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Not a file name: {}", path.display()))?
        .to_string())
}

async fn read_file(path: &Path, name: String) -> Result<UploadFile> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(UploadFile {
        name,
        data,
        mime: None,
    })
}

/// Collects every file below `root`; `dirs` is the relative path of `root`
async fn read_tree(root: &Path, dirs: Vec<String>, items: &mut Vec<FolderItem>) -> Result<()> {
    let mut pending = vec![(root.to_path_buf(), dirs)];
    while let Some((dir, dirs)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = file_name(&path)?;
            if entry.file_type().await?.is_dir() {
                let mut sub = dirs.clone();
                sub.push(name);
                pending.push((path, sub));
            } else {
                items.push(FolderItem {
                    dirs: dirs.clone(),
                    file: read_file(&path, name).await?,
                });
            }
        }
    }
    Ok(())
}

async fn show_progress(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::UploadProgress { bytes_done, total }) => {
                eprint!("\r  {} / {}", human_size(bytes_done), human_size(total));
                if bytes_done >= total {
                    eprintln!();
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Progress events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_report(
    report: &UploadReport,
    total: u64,
    format: OutputFormat,
    formatter: &dyn OutputFormatter,
) -> Result<()> {
    if format.is_json() {
        let json = serde_json::json!({
            "committed": report.committed,
            "skipped": report.skipped,
            "renamed": report.renamed,
            "failed": report.failed,
            "bytes": total,
        });
        formatter.print_json(&json);
        return Ok(());
    }

    if report.is_complete() {
        formatter.success(&format!(
            "Uploaded {} file(s), {}",
            report.committed.len(),
            human_size(total)
        ));
    } else {
        formatter.error(&format!("{} file(s) failed", report.failed.len()));
    }
    for entry in &report.committed {
        formatter.info(&entry_line(entry));
    }
    for name in &report.skipped {
        formatter.info(&format!("skipped  {name}"));
    }
    for (from, to) in &report.renamed {
        formatter.info(&format!("renamed  {from} -> {to}"));
    }
    for (name, reason) in &report.failed {
        formatter.warn(&format!("{name}: {reason}"));
    }
    Ok(())
}
