//! Upload pipeline
//!
//! Turns one user upload into connector requests on the upload lane:
//!
//! 1. **Capacity** - an invocation above `max_items_per_call` is rejected
//!    before anything else happens.
//! 2. **Pre-flight** - `ls` with the incoming names finds collisions, which
//!    the conflict resolver settles (skip, overwrite, rename or cancel).
//! 3. **Planning** - files at or below the chunk threshold are grouped into
//!    batches; larger files become a chunk job.
//! 4. **Transfer** - batches and chunks run concurrently, bounded by the
//!    dispatcher's upload lane. A failed chunk is retried after a fixed
//!    delay; running out of attempts fails that file only.
//! 5. **Commit** - a chunked file is committed by one more request carrying
//!    the merge token. Batch responses and merge responses are the only ones
//!    applied to the cache.
//!
//! Folder uploads ([`UploadPipeline::upload_folder`]) group files by their
//! relative directory, find or `mkdir` each directory below the destination
//! (parents first), then run the steps above once per directory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{join_all, try_join_all};
use remfs_cache::Reconciler;
use remfs_core::config::UploadConfig;
use remfs_core::domain::{
    ChangeSet, ChunkDescriptor, Command, CommandKind, Entry, EntryId, MergeToken, UploadFile,
    UploadPayload,
};
use remfs_core::ports::{
    ClientEvent, ConflictAction, EventBus, IConflictResolver, NormalizedResponse,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::conflict::{resolve_collisions, unique_name};
use crate::dispatcher::{Dispatcher, RequestOptions};
use crate::{CapacityError, ClientError, DispatchError};

// ============================================================================
// Report
// ============================================================================

/// Result of one upload invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Entries the server created, as applied to the cache
    pub committed: Vec<Entry>,
    /// Names left alone because of a `Skip` decision
    pub skipped: Vec<String>,
    /// `(original, uploaded as)` pairs from `Rename` decisions
    pub renamed: Vec<(String, String)>,
    /// `(name, reason)` for files that could not be transferred
    pub failed: Vec<(String, String)>,
}

impl UploadReport {
    /// Whether every planned file was committed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Appends the report of one directory of a folder upload
    ///
    /// Names are prefixed with `dir` so they stay unambiguous.
    fn absorb(&mut self, other: UploadReport, dir: &str) {
        let qualify = |name: String| {
            if dir.is_empty() {
                name
            } else {
                format!("{dir}/{name}")
            }
        };
        self.committed.extend(other.committed);
        self.skipped.extend(other.skipped.into_iter().map(qualify));
        self.renamed
            .extend(other.renamed.into_iter().map(|(from, to)| (qualify(from), to)));
        self.failed
            .extend(other.failed.into_iter().map(|(name, reason)| (qualify(name), reason)));
    }
}

// ============================================================================
// Folder items
// ============================================================================

/// One file of a folder upload, placed below the destination by `dirs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderItem {
    /// Directory names from the destination down to the file's parent
    pub dirs: Vec<String>,
    pub file: UploadFile,
}

impl FolderItem {
    /// Item for a file going straight into the destination
    pub fn flat(file: UploadFile) -> Self {
        Self {
            dirs: Vec::new(),
            file,
        }
    }

    /// Builds an item from a relative path such as `photos/2024/a.jpg`
    ///
    /// Both `/` and backslash separate segments; empty and `.` segments are
    /// dropped. Returns `None` when no file name remains or a segment is
    /// `..`.
    pub fn from_relative_path(path: &str, data: Vec<u8>) -> Option<Self> {
        let mut segments = Vec::new();
        for segment in path.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => return None,
                other => segments.push(other.to_string()),
            }
        }
        let name = segments.pop()?;
        Some(Self {
            dirs: segments,
            file: UploadFile {
                name,
                data,
                mime: None,
            },
        })
    }
}

/// Files grouped by relative directory; parents sort before their children
fn group_by_dir(items: Vec<FolderItem>) -> BTreeMap<Vec<String>, Vec<UploadFile>> {
    let mut groups: BTreeMap<Vec<String>, Vec<UploadFile>> = BTreeMap::new();
    for item in items {
        groups.entry(item.dirs).or_default().push(item.file);
    }
    groups
}

// ============================================================================
// Plan
// ============================================================================

/// Whole files sent in one request
#[derive(Debug, Clone, PartialEq, Eq)]
struct Batch {
    files: Vec<UploadFile>,
    overwrite: bool,
}

impl Batch {
    fn bytes(&self) -> u64 {
        self.files.iter().map(|f| f.data.len() as u64).sum()
    }
}

/// Chunk plan for one file above the threshold
#[derive(Debug, Clone)]
struct ChunkJob {
    file: UploadFile,
    overwrite: bool,
    chunks: Vec<ChunkDescriptor>,
}

impl ChunkJob {
    fn new(file: UploadFile, overwrite: bool, chunk_size: u64) -> Self {
        let file_size = file.data.len() as u64;
        let chunk_size = chunk_size.max(1);
        let total = file_size.div_ceil(chunk_size) as usize;
        let cid = uuid::Uuid::new_v4().simple().to_string();
        let chunks = (0..total)
            .map(|index| {
                let offset = index as u64 * chunk_size;
                ChunkDescriptor {
                    cid: cid.clone(),
                    index,
                    total,
                    offset,
                    length: chunk_size.min(file_size - offset),
                    file_size,
                }
            })
            .collect();
        Self {
            file,
            overwrite,
            chunks,
        }
    }

    fn chunk_file(&self, chunk: &ChunkDescriptor) -> UploadFile {
        let start = chunk.offset as usize;
        let end = start + chunk.length as usize;
        UploadFile {
            name: self.file.name.clone(),
            data: self.file.data[start..end].to_vec(),
            mime: self.file.mime.clone(),
        }
    }
}

/// Splits `requested` items into call sizes no larger than `limit`
fn suggest_split(requested: usize, limit: usize) -> Vec<usize> {
    let mut split = vec![limit; requested / limit];
    if requested % limit > 0 {
        split.push(requested % limit);
    }
    split
}

/// Groups whole files into batches per overwrite flag
fn plan_batches(files: Vec<(UploadFile, bool)>, max_files: usize, max_bytes: u64) -> Vec<Batch> {
    let max_files = max_files.max(1);
    let mut batches: Vec<Batch> = Vec::new();
    for overwrite in [false, true] {
        let mut current = Batch {
            files: Vec::new(),
            overwrite,
        };
        for (file, _) in files.iter().filter(|(_, o)| *o == overwrite) {
            let size = file.data.len() as u64;
            let full = current.files.len() >= max_files
                || (!current.files.is_empty() && current.bytes() + size > max_bytes);
            if full {
                let next = Batch {
                    files: Vec::new(),
                    overwrite,
                };
                batches.push(std::mem::replace(&mut current, next));
            }
            current.files.push(file.clone());
        }
        if !current.files.is_empty() {
            batches.push(current);
        }
    }
    batches
}

// ============================================================================
// UploadPipeline
// ============================================================================

/// Plans and runs uploads into one destination directory
pub struct UploadPipeline {
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    events: EventBus,
    config: UploadConfig,
    resolver: Option<Arc<dyn IConflictResolver>>,
}

/// Bytes transferred so far in one invocation
struct Progress {
    done: AtomicU64,
    total: u64,
    events: EventBus,
}

impl Progress {
    fn advance(&self, bytes: u64) {
        let done = self.done.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.events.emit(ClientEvent::UploadProgress {
            bytes_done: done,
            total: self.total,
        });
    }
}

impl UploadPipeline {
    pub fn new(dispatcher: Dispatcher, reconciler: Reconciler, config: UploadConfig) -> Self {
        Self {
            events: dispatcher.events().clone(),
            dispatcher,
            reconciler,
            config,
            resolver: None,
        }
    }

    /// Sets the resolver consulted about name collisions
    pub fn with_resolver(mut self, resolver: Arc<dyn IConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Largest file sent whole: `min(chunk size, server max - safety margin)`
    pub fn threshold(&self, server_max: Option<u64>) -> u64 {
        let chunk = self.config.chunk_size_bytes();
        let threshold = match server_max {
            Some(max) => chunk.min(max.saturating_sub(self.config.safety_margin_bytes)),
            None => chunk,
        };
        threshold.max(1)
    }

    /// Uploads `items` into `target`
    ///
    /// # Arguments
    /// * `items` - Files to upload
    /// * `target` - Destination directory
    /// * `server_max` - Largest request the server accepts, when known
    /// * `cancel` - Cancels every request of this invocation
    ///
    /// # Errors
    /// - [`CapacityError`] if there are more items than one call may carry
    /// - [`crate::ConflictError`] if collisions cannot be resolved
    /// - [`DispatchError`] if the pre-flight query fails
    ///
    /// Per-file transfer failures do not fail the call; they are listed in
    /// [`UploadReport::failed`].
    #[instrument(skip(self, items, cancel), fields(target = %target, items = items.len()))]
    pub async fn upload(
        &self,
        items: Vec<UploadFile>,
        target: &EntryId,
        server_max: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, ClientError> {
        self.check_capacity(items.len())?;

        let mut report = UploadReport::default();
        if items.is_empty() {
            return Ok(report);
        }

        let existing = self.preflight(&items, target, cancel).await?;
        let collisions = existing_collisions(&items, &existing);
        let decisions = resolve_collisions(
            self.resolver.as_deref(),
            CommandKind::Upload,
            target,
            collisions,
        )
        .await?;

        let mut taken: HashSet<String> = existing.keys().cloned().collect();
        taken.extend(items.iter().map(|f| f.name.clone()));
        if decisions.values().any(|action| *action == ConflictAction::Rename) {
            // The pre-flight reply only covers incoming names; renamed files
            // must also avoid every other name in the directory.
            let listing = self.list_names(target, Vec::new(), cancel).await?;
            taken.extend(listing.into_keys());
        }
        let mut planned = Vec::with_capacity(items.len());
        for mut file in items {
            match decisions.get(&file.name) {
                None => planned.push((file, false)),
                Some(ConflictAction::Skip) => report.skipped.push(file.name),
                Some(ConflictAction::Overwrite) => planned.push((file, true)),
                Some(ConflictAction::Rename) => {
                    let renamed = unique_name(&file.name, &taken);
                    taken.insert(renamed.clone());
                    let original = std::mem::replace(&mut file.name, renamed.clone());
                    report.renamed.push((original, renamed));
                    planned.push((file, false));
                }
                // resolve_collisions never hands back Cancel
                Some(ConflictAction::Cancel) => report.skipped.push(file.name),
            }
        }

        let threshold = self.threshold(server_max);
        let (whole, large): (Vec<_>, Vec<_>) = planned
            .into_iter()
            .partition(|(file, _)| file.data.len() as u64 <= threshold);
        let progress = Progress {
            done: AtomicU64::new(0),
            total: whole
                .iter()
                .chain(&large)
                .map(|(f, _)| f.data.len() as u64)
                .sum(),
            events: self.events.clone(),
        };
        let batches = plan_batches(whole, self.config.max_files_per_batch, self.config.max_batch_bytes());
        let jobs: Vec<ChunkJob> = large
            .into_iter()
            .map(|(file, overwrite)| ChunkJob::new(file, overwrite, threshold))
            .collect();
        info!(
            batches = batches.len(),
            chunked = jobs.len(),
            threshold,
            total_bytes = progress.total,
            "Upload planned"
        );

        let outcome = Mutex::new(report);
        let batch_runs = batches
            .into_iter()
            .map(|batch| self.run_batch(batch, target, cancel, &progress, &outcome));
        let job_runs = jobs
            .into_iter()
            .map(|job| self.run_chunk_job(job, target, cancel, &progress, &outcome));
        futures_util::join!(join_all(batch_runs), join_all(job_runs));

        let report = outcome.into_inner().unwrap_or_else(PoisonError::into_inner);
        info!(
            committed = report.committed.len(),
            skipped = report.skipped.len(),
            renamed = report.renamed.len(),
            failed = report.failed.len(),
            "Upload finished"
        );
        Ok(report)
    }

    /// Uploads a directory tree below `target`
    ///
    /// Directories named by the items are looked up with `ls` and created
    /// with `mkdir` when absent, parents first; an existing directory of the
    /// same name is reused. Each directory's files then go through
    /// [`UploadPipeline::upload`]. Names in the returned report carry their
    /// relative directory.
    ///
    /// # Errors
    /// - [`CapacityError`] if there are more items than one call may carry
    /// - [`DispatchError`] if a directory cannot be resolved or created
    /// - any error of [`UploadPipeline::upload`] for one directory, which
    ///   stops the remaining directories
    #[instrument(skip(self, items, cancel), fields(target = %target, items = items.len()))]
    pub async fn upload_folder(
        &self,
        items: Vec<FolderItem>,
        target: &EntryId,
        server_max: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, ClientError> {
        self.check_capacity(items.len())?;

        let groups = group_by_dir(items);
        info!(directories = groups.len(), "Folder upload planned");
        let mut resolved: HashMap<Vec<String>, EntryId> = HashMap::new();
        let mut report = UploadReport::default();
        for (path, files) in groups {
            let dir = self.ensure_dir(target, &path, &mut resolved, cancel).await?;
            let part = self.upload(files, &dir, server_max, cancel).await?;
            report.absorb(part, &path.join("/"));
        }
        Ok(report)
    }

    /// Id of the directory at `path` below `target`, creating missing levels
    async fn ensure_dir(
        &self,
        target: &EntryId,
        path: &[String],
        resolved: &mut HashMap<Vec<String>, EntryId>,
        cancel: &CancellationToken,
    ) -> Result<EntryId, ClientError> {
        let mut parent = target.clone();
        for depth in 1..=path.len() {
            let prefix = &path[..depth];
            parent = match resolved.get(prefix) {
                Some(id) => id.clone(),
                None => {
                    let id = self.subdirectory(&parent, &path[depth - 1], cancel).await?;
                    resolved.insert(prefix.to_vec(), id.clone());
                    id
                }
            };
        }
        Ok(parent)
    }

    async fn subdirectory(
        &self,
        parent: &EntryId,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<EntryId, ClientError> {
        let existing = self.list_names(parent, vec![name.to_string()], cancel).await?;
        if let Some(Some(id)) = existing.get(name) {
            debug!(%parent, %name, "Reusing existing directory");
            return Ok(id.clone());
        }

        let response = self
            .dispatcher
            .execute(
                Command::Mkdir {
                    target: parent.clone(),
                    name: name.to_string(),
                },
                RequestOptions::for_command(CommandKind::Mkdir).cancel_token(cancel.clone()),
            )
            .await?;
        self.commit(response)
            .into_iter()
            .find(|e| e.is_directory && e.name == name)
            .map(|e| e.id)
            .ok_or_else(|| {
                ClientError::InvalidResponse(format!("mkdir of {name} returned no directory"))
            })
    }

    fn check_capacity(&self, requested: usize) -> Result<(), CapacityError> {
        let limit = self.config.max_items_per_call;
        if limit > 0 && requested > limit {
            let suggested = suggest_split(requested, limit);
            warn!(requested, limit, ?suggested, "Upload rejected: too many items");
            return Err(CapacityError::TooManyItems {
                limit,
                requested,
                suggested,
            });
        }
        Ok(())
    }

    /// Names already present in `target` among the incoming ones
    async fn preflight(
        &self,
        items: &[UploadFile],
        target: &EntryId,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Option<EntryId>>, DispatchError> {
        let mut names: Vec<String> = items.iter().map(|f| f.name.clone()).collect();
        names.sort();
        names.dedup();
        self.list_names(target, names, cancel).await
    }

    /// `ls` of `target`; an empty `intersect` lists every name
    async fn list_names(
        &self,
        target: &EntryId,
        intersect: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Option<EntryId>>, DispatchError> {
        let response = self
            .dispatcher
            .execute(
                Command::Ls {
                    target: target.clone(),
                    intersect,
                },
                RequestOptions::for_command(CommandKind::Ls).cancel_token(cancel.clone()),
            )
            .await?;
        Ok(response.listing.into_iter().collect())
    }

    fn options(&self, cancel: &CancellationToken) -> RequestOptions {
        RequestOptions::for_command(CommandKind::Upload).cancel_token(cancel.clone())
    }

    async fn run_batch(
        &self,
        batch: Batch,
        target: &EntryId,
        cancel: &CancellationToken,
        progress: &Progress,
        outcome: &Mutex<UploadReport>,
    ) {
        let bytes = batch.bytes();
        let names: Vec<String> = batch.files.iter().map(|f| f.name.clone()).collect();
        let command = Command::Upload(UploadPayload::Files {
            target: target.clone(),
            files: batch.files,
            overwrite: batch.overwrite,
        });

        match self.dispatcher.execute(command, self.options(cancel)).await {
            Ok(response) => {
                progress.advance(bytes);
                let committed = self.commit(response);
                lock(outcome).committed.extend(committed);
            }
            Err(err) => {
                warn!(files = names.len(), error = %err, "Upload batch failed");
                let reason = err.to_string();
                lock(outcome)
                    .failed
                    .extend(names.into_iter().map(|name| (name, reason.clone())));
            }
        }
    }

    async fn run_chunk_job(
        &self,
        job: ChunkJob,
        target: &EntryId,
        cancel: &CancellationToken,
        progress: &Progress,
        outcome: &Mutex<UploadReport>,
    ) {
        let name = job.file.name.clone();
        match self.transfer_chunks(&job, target, cancel, progress).await {
            Ok(committed) => lock(outcome).committed.extend(committed),
            Err(err) => {
                warn!(file = %name, error = %err, "Chunked upload failed");
                lock(outcome).failed.push((name, err.to_string()));
            }
        }
    }

    async fn transfer_chunks(
        &self,
        job: &ChunkJob,
        target: &EntryId,
        cancel: &CancellationToken,
        progress: &Progress,
    ) -> Result<Vec<Entry>, ClientError> {
        let job_cancel = cancel.child_token();
        debug!(file = %job.file.name, chunks = job.chunks.len(), "Sending chunks");

        let sends = job.chunks.iter().map(|chunk| {
            let job_cancel = job_cancel.clone();
            async move {
                let result = self.send_chunk(job, chunk, target, &job_cancel).await;
                match &result {
                    Ok(_) => progress.advance(chunk.length),
                    // Siblings are pointless once one chunk is lost.
                    Err(_) => job_cancel.cancel(),
                }
                result
            }
        });
        let responses = try_join_all(sends).await?;

        let merged = responses.into_iter().find_map(|r| r.merge_token);
        let Some(token) = merged else {
            return Err(ClientError::InvalidResponse(format!(
                "no merge token after the last chunk of {}",
                job.file.name
            )));
        };
        self.merge(job, token, target, cancel).await
    }

    async fn send_chunk(
        &self,
        job: &ChunkJob,
        chunk: &ChunkDescriptor,
        target: &EntryId,
        cancel: &CancellationToken,
    ) -> Result<NormalizedResponse, DispatchError> {
        let attempts = self.config.chunk_attempts.max(1);
        let mut attempt = 1;
        loop {
            let command = Command::Upload(UploadPayload::Chunk {
                target: target.clone(),
                file: job.chunk_file(chunk),
                chunk: chunk.clone(),
                overwrite: job.overwrite,
            });
            match self.dispatcher.execute(command, self.options(cancel)).await {
                Err(DispatchError::Transport(err)) if attempt < attempts => {
                    debug!(
                        part = %chunk.part_name(&job.file.name),
                        attempt,
                        error = %err,
                        "Chunk failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DispatchError::Aborted { quiet: true }),
                        _ = tokio::time::sleep(self.config.chunk_retry_delay()) => {}
                    }
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn merge(
        &self,
        job: &ChunkJob,
        token: MergeToken,
        target: &EntryId,
        cancel: &CancellationToken,
    ) -> Result<Vec<Entry>, ClientError> {
        let command = Command::Upload(UploadPayload::Merge {
            target: target.clone(),
            token,
            name: job.file.name.clone(),
            overwrite: job.overwrite,
        });
        let response = self.dispatcher.execute(command, self.options(cancel)).await?;
        Ok(self.commit(response))
    }

    /// Applies a commit response to the cache and publishes it
    fn commit(&self, response: NormalizedResponse) -> Vec<Entry> {
        let applied = self.reconciler.apply_changes(ChangeSet {
            added: response.added,
            removed: response.removed,
            changed: response.changed,
        });
        self.events.publish_changes(&applied);
        applied.added.into_iter().chain(applied.changed).collect()
    }
}

fn lock(report: &Mutex<UploadReport>) -> std::sync::MutexGuard<'_, UploadReport> {
    report.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Incoming names that already exist, once each, in input order
fn existing_collisions(
    items: &[UploadFile],
    existing: &HashMap<String, Option<EntryId>>,
) -> Vec<(String, Option<EntryId>)> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|f| seen.insert(f.name.as_str()))
        .filter_map(|f| existing.get(&f.name).map(|id| (f.name.clone(), id.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dir, file, id, root, MockReply, MockTransport};
    use crate::ConflictError;
    use remfs_cache::EntryCache;
    use remfs_core::config::DispatcherConfig;
    use remfs_core::domain::ChangeKind;
    use remfs_core::ports::{FixedResolver, TransportError, TransportRequest};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    const MARGIN: u64 = 8 * 1024;

    fn payload(req: &TransportRequest) -> Option<&UploadPayload> {
        match &req.command {
            Command::Upload(payload) => Some(payload),
            _ => None,
        }
    }

    /// Answer of a connector that already holds `existing` names in `d1`
    fn reply_for(existing: &[&str], req: &TransportRequest) -> MockReply {
        let mut response = NormalizedResponse::default();
        match &req.command {
            Command::Ls { intersect, .. } => {
                response.listing = existing
                    .iter()
                    .filter(|n| intersect.is_empty() || intersect.iter().any(|i| i == *n))
                    .map(|n| (n.to_string(), Some(id(&format!("old_{n}")))))
                    .collect::<BTreeMap<_, _>>();
            }
            Command::Upload(UploadPayload::Files { files, .. }) => {
                response.added = files.iter().map(|f| file(&f.name, "d1")).collect();
            }
            Command::Upload(UploadPayload::Chunk {
                file: part, chunk, ..
            }) => {
                if chunk.index + 1 == chunk.total {
                    let token = MergeToken::new(format!("{}.merged", part.name)).unwrap();
                    response.merge_token = Some(token);
                }
            }
            Command::Upload(UploadPayload::Merge { name, .. }) => {
                response.added = vec![file(name, "d1")];
            }
            Command::Mkdir { target, name } => {
                response.added = vec![dir(name, target.as_str())];
            }
            _ => {}
        }
        MockReply::ok(response)
    }

    fn connector(existing: &'static [&'static str]) -> Arc<MockTransport> {
        MockTransport::new(move |req, _| reply_for(existing, req))
    }

    fn pipeline(transport: Arc<MockTransport>, config: UploadConfig) -> (UploadPipeline, Arc<EntryCache>) {
        let cache = Arc::new(EntryCache::new());
        cache.upsert(vec![root("v1"), dir("d1", "v1")], ChangeKind::Snapshot);
        let dispatcher = Dispatcher::new(
            transport,
            EventBus::default(),
            &DispatcherConfig::default(),
            &config,
        );
        let reconciler = Reconciler::new(Arc::clone(&cache));
        (UploadPipeline::new(dispatcher, reconciler, config), cache)
    }

    fn item(name: &str, len: usize) -> UploadFile {
        UploadFile {
            name: name.into(),
            data: vec![7; len],
            mime: None,
        }
    }

    #[test]
    fn test_suggest_split() {
        assert_eq!(suggest_split(7, 3), vec![3, 3, 1]);
        assert_eq!(suggest_split(6, 3), vec![3, 3]);
    }

    #[test]
    fn test_plan_batches_respects_limits() {
        let files = vec![
            (item("a", 10), false),
            (item("b", 10), false),
            (item("c", 10), false),
            (item("d", 10), true),
        ];
        let batches = plan_batches(files, 2, 1024);
        let shape: Vec<_> = batches
            .iter()
            .map(|b| (b.files.len(), b.overwrite))
            .collect();
        assert_eq!(shape, vec![(2, false), (1, false), (1, true)]);

        let files = vec![(item("a", 10), false), (item("b", 10), false)];
        assert_eq!(plan_batches(files, 20, 15).len(), 2);
    }

    #[test]
    fn test_chunk_job_covers_file() {
        let job = ChunkJob::new(item("big.bin", 25), false, 10);
        let ranges: Vec<_> = job.chunks.iter().map(|c| c.range_param()).collect();
        assert_eq!(ranges, vec!["0,10,25", "10,10,25", "20,5,25"]);
        assert!(job.chunks.iter().all(|c| c.cid == job.chunks[0].cid && c.total == 3));
        assert_eq!(job.chunk_file(&job.chunks[2]).data.len(), 5);
    }

    #[test]
    fn test_threshold_uses_server_limit() {
        let (p, _) = pipeline(connector(&[]), UploadConfig::default());
        assert_eq!(p.threshold(None), 10 * 1024 * 1024);
        assert_eq!(p.threshold(Some(MARGIN + 100)), 100);
        assert_eq!(p.threshold(Some(1)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_files_are_batched_and_committed() {
        let transport = connector(&[]);
        let config = UploadConfig {
            max_files_per_batch: 2,
            ..UploadConfig::default()
        };
        let (p, cache) = pipeline(transport.clone(), config);

        let report = p
            .upload(
                vec![item("a", 3), item("b", 3), item("c", 3)],
                &id("d1"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.committed.len(), 3);
        assert!(report.is_complete());
        assert_eq!(transport.count(CommandKind::Ls), 1);
        assert_eq!(transport.count(CommandKind::Upload), 2);
        assert!(cache.contains(&id("c")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_file_is_chunked_then_merged() {
        let transport = connector(&[]);
        let (p, cache) = pipeline(transport.clone(), UploadConfig::default());
        let bus = p.events.clone();
        let mut rx = bus.subscribe();

        let report = p
            .upload(
                vec![item("big.bin", 25)],
                &id("d1"),
                Some(MARGIN + 10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let uploads: Vec<_> = transport.requests().into_iter().filter_map(|r| match r.command {
            Command::Upload(payload) => Some(payload),
            _ => None,
        }).collect();
        assert_eq!(uploads.len(), 4);
        let merge = uploads.last().unwrap();
        assert!(matches!(
            merge,
            UploadPayload::Merge { token, name, .. }
                if token.as_str() == "big.bin.merged" && name == "big.bin"
        ));
        assert_eq!(report.committed.len(), 1);
        assert!(cache.contains(&id("big.bin")));

        let mut last_progress = None;
        let mut added = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                ClientEvent::UploadProgress { bytes_done, total } => {
                    last_progress = Some((bytes_done, total));
                }
                ClientEvent::EntriesAdded(ids) => added += ids.len(),
                _ => {}
            }
        }
        assert_eq!(last_progress, Some((25, 25)));
        assert_eq!(added, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_is_retried() {
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        let transport = MockTransport::new(move |req, _| {
            if let Some(UploadPayload::Chunk { chunk, .. }) = payload(req) {
                if chunk.index == 1 && seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    return MockReply::err(TransportError::Network("reset".into()));
                }
            }
            reply_for(&[], req)
        });
        let (p, _) = pipeline(transport.clone(), UploadConfig::default());

        let report = p
            .upload(
                vec![item("big.bin", 25)],
                &id("d1"),
                Some(MARGIN + 10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.is_complete());
        let chunk_requests = transport
            .requests()
            .iter()
            .filter(|r| matches!(payload(r), Some(UploadPayload::Chunk { .. })))
            .count();
        assert_eq!(chunk_requests, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_commits_on_last_allowed_attempt() {
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        let transport = MockTransport::new(move |req, _| {
            if let Some(UploadPayload::Chunk { chunk, .. }) = payload(req) {
                if chunk.index == 1 && seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    return MockReply::err(TransportError::Network("reset".into()));
                }
            }
            reply_for(&[], req)
        });
        let config = UploadConfig {
            chunk_attempts: 3,
            ..UploadConfig::default()
        };
        let (p, cache) = pipeline(transport.clone(), config);

        let report = p
            .upload(
                vec![item("big.bin", 25)],
                &id("d1"),
                Some(MARGIN + 10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.committed.len(), 1);
        assert!(cache.contains(&id("big.bin")));
        assert_eq!(failures.load(Ordering::SeqCst), 3);
        let second_chunk_sends = transport
            .requests()
            .iter()
            .filter(|r| matches!(payload(r), Some(UploadPayload::Chunk { chunk, .. }) if chunk.index == 1))
            .count();
        assert_eq!(second_chunk_sends, 3);
        assert!(transport
            .requests()
            .iter()
            .any(|r| matches!(payload(r), Some(UploadPayload::Merge { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_chunk_fails_only_that_file() {
        let transport = MockTransport::new(move |req, _| {
            if let Some(UploadPayload::Chunk { chunk, .. }) = payload(req) {
                if chunk.index == 1 {
                    return MockReply::err(TransportError::Network("reset".into()));
                }
            }
            reply_for(&[], req)
        });
        let config = UploadConfig {
            chunk_attempts: 2,
            ..UploadConfig::default()
        };
        let (p, cache) = pipeline(transport.clone(), config);

        let report = p
            .upload(
                vec![item("big.bin", 25), item("small.txt", 4)],
                &id("d1"),
                Some(MARGIN + 10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "big.bin");
        assert_eq!(report.committed.len(), 1);
        assert!(cache.contains(&id("small.txt")));
        assert!(!cache.contains(&id("big.bin")));
        assert!(transport
            .requests()
            .iter()
            .all(|r| !matches!(payload(r), Some(UploadPayload::Merge { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_items_is_rejected_before_transfer() {
        let transport = connector(&[]);
        let config = UploadConfig {
            max_items_per_call: 2,
            ..UploadConfig::default()
        };
        let (p, _) = pipeline(transport.clone(), config);
        let items = (0..5).map(|i| item(&format!("f{i}"), 1)).collect();

        let err = p
            .upload(items, &id("d1"), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClientError::Capacity(CapacityError::TooManyItems { limit: 2, requested: 5, ref suggested })
                if suggested == &vec![2, 2, 1]
        ));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collision_without_resolver_moves_no_bytes() {
        let transport = connector(&["a.txt"]);
        let (p, _) = pipeline(transport.clone(), UploadConfig::default());

        let err = p
            .upload(
                vec![item("a.txt", 1), item("b.txt", 1)],
                &id("d1"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClientError::Conflict(ConflictError::Unresolved(ref names)) if names == &vec!["a.txt".to_string()]
        ));
        assert_eq!(transport.count(CommandKind::Upload), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_decision_uploads_under_new_name() {
        let transport = connector(&["a.txt", "a-1.txt"]);
        let (p, _) = pipeline(transport.clone(), UploadConfig::default());
        let p = p.with_resolver(Arc::new(FixedResolver(ConflictAction::Rename)));

        let report = p
            .upload(vec![item("a.txt", 1)], &id("d1"), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.renamed, vec![("a.txt".to_string(), "a-2.txt".to_string())]);
        assert_eq!(report.committed[0].name, "a-2.txt");
        assert_eq!(transport.count(CommandKind::Ls), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_avoids_names_outside_the_batch() {
        let transport = connector(&["a.txt", "a-1.txt", "a-2.txt", "b.txt"]);
        let (p, _) = pipeline(transport.clone(), UploadConfig::default());
        let p = p.with_resolver(Arc::new(FixedResolver(ConflictAction::Rename)));

        let report = p
            .upload(
                vec![item("a.txt", 1), item("b.txt", 1)],
                &id("d1"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut renamed = report.renamed.clone();
        renamed.sort();
        assert_eq!(
            renamed,
            vec![
                ("a.txt".to_string(), "a-3.txt".to_string()),
                ("b.txt".to_string(), "b-1.txt".to_string()),
            ]
        );
        let uploaded: Vec<String> = transport
            .requests()
            .iter()
            .filter_map(|r| match payload(r) {
                Some(UploadPayload::Files { files, .. }) => {
                    Some(files.iter().map(|f| f.name.clone()).collect::<Vec<_>>())
                }
                _ => None,
            })
            .flatten()
            .collect();
        assert!(uploaded.iter().all(|n| !["a.txt", "a-1.txt", "a-2.txt", "b.txt"].contains(&n.as_str())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_full_listing_without_rename() {
        let transport = connector(&["keep.txt"]);
        let (p, _) = pipeline(transport.clone(), UploadConfig::default());
        let p = p.with_resolver(Arc::new(FixedResolver(ConflictAction::Skip)));

        p.upload(vec![item("keep.txt", 1)], &id("d1"), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transport.count(CommandKind::Ls), 1);
    }

    #[test]
    fn test_folder_item_from_relative_path() {
        let item = FolderItem::from_relative_path("photos/2024/a.jpg", vec![1]).unwrap();
        assert_eq!(item.dirs, vec!["photos".to_string(), "2024".to_string()]);
        assert_eq!(item.file.name, "a.jpg");

        let item = FolderItem::from_relative_path("./docs\\notes.txt", vec![]).unwrap();
        assert_eq!(item.dirs, vec!["docs".to_string()]);
        assert_eq!(item.file.name, "notes.txt");

        assert!(FolderItem::from_relative_path("../escape.txt", vec![]).is_none());
        assert!(FolderItem::from_relative_path("/", vec![]).is_none());
    }

    #[test]
    fn test_group_by_dir_orders_parents_first() {
        let items = vec![
            FolderItem::from_relative_path("a/b/deep.txt", vec![]).unwrap(),
            FolderItem::from_relative_path("top.txt", vec![]).unwrap(),
            FolderItem::from_relative_path("a/mid.txt", vec![]).unwrap(),
        ];
        let keys: Vec<Vec<String>> = group_by_dir(items).into_keys().collect();
        assert_eq!(
            keys,
            vec![
                vec![],
                vec!["a".to_string()],
                vec!["a".to_string(), "b".to_string()],
            ]
        );
    }

    #[test]
    fn test_absorb_qualifies_names() {
        let mut report = UploadReport::default();
        report.absorb(
            UploadReport {
                skipped: vec!["x.txt".into()],
                failed: vec![("y.bin".into(), "reset".into())],
                ..UploadReport::default()
            },
            "photos/2024",
        );
        assert_eq!(report.skipped, vec!["photos/2024/x.txt".to_string()]);
        assert_eq!(report.failed[0].0, "photos/2024/y.bin");
    }

    fn upload_targets(transport: &MockTransport) -> Vec<EntryId> {
        transport
            .requests()
            .iter()
            .filter_map(|r| match payload(r) {
                Some(UploadPayload::Files { target, .. }) => Some(target.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_folder_upload_creates_missing_directories() {
        let transport = connector(&[]);
        let (p, cache) = pipeline(transport.clone(), UploadConfig::default());
        let items = vec![
            FolderItem::from_relative_path("photos/2024/a.jpg", vec![1; 3]).unwrap(),
            FolderItem::from_relative_path("photos/b.jpg", vec![1; 3]).unwrap(),
            FolderItem::flat(item("top.txt", 2)),
        ];

        let report = p
            .upload_folder(items, &id("d1"), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.committed.len(), 3);
        let mkdirs: Vec<(EntryId, String)> = transport
            .requests()
            .into_iter()
            .filter_map(|r| match r.command {
                Command::Mkdir { target, name } => Some((target, name)),
                _ => None,
            })
            .collect();
        assert_eq!(
            mkdirs,
            vec![(id("d1"), "photos".to_string()), (id("photos"), "2024".to_string())]
        );
        assert_eq!(upload_targets(&transport), vec![id("d1"), id("photos"), id("2024")]);
        assert_eq!(cache.get(&id("2024")).unwrap().parent_id, Some(id("photos")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_folder_upload_reuses_existing_directory() {
        let transport = connector(&["photos"]);
        let (p, _) = pipeline(transport.clone(), UploadConfig::default());
        let items = vec![FolderItem::from_relative_path("photos/b.jpg", vec![1]).unwrap()];

        let report = p
            .upload_folder(items, &id("d1"), None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(transport.count(CommandKind::Mkdir), 0);
        assert_eq!(upload_targets(&transport), vec![id("old_photos")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_folder_upload_respects_item_limit() {
        let transport = connector(&[]);
        let config = UploadConfig {
            max_items_per_call: 1,
            ..UploadConfig::default()
        };
        let (p, _) = pipeline(transport.clone(), config);
        let items = vec![
            FolderItem::from_relative_path("a/x", vec![]).unwrap(),
            FolderItem::from_relative_path("b/y", vec![]).unwrap(),
        ];

        let err = p
            .upload_folder(items, &id("d1"), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Capacity(_)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_and_overwrite_decisions() {
        let transport = connector(&["keep.txt"]);
        let (p, _) = pipeline(transport.clone(), UploadConfig::default());
        let skipping = p.with_resolver(Arc::new(FixedResolver(ConflictAction::Skip)));
        let report = skipping
            .upload(
                vec![item("keep.txt", 1), item("new.txt", 1)],
                &id("d1"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.skipped, vec!["keep.txt".to_string()]);
        assert_eq!(report.committed.len(), 1);

        let overwriting = skipping.with_resolver(Arc::new(FixedResolver(ConflictAction::Overwrite)));
        overwriting
            .upload(vec![item("keep.txt", 1)], &id("d1"), None, &CancellationToken::new())
            .await
            .unwrap();
        let last = transport.requests().pop().unwrap();
        assert!(matches!(
            payload(&last),
            Some(UploadPayload::Files { overwrite: true, .. })
        ));
    }
}
