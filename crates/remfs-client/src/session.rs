//! Browser session - the command facade front ends drive
//!
//! [`Browser`] wires the dispatcher, cache, reconciler, upload pipeline and
//! sync engine together and exposes the connector vocabulary as methods.
//! Every command runs in its own task and returns an [`Operation`]: a
//! cancellable handle whose outcome can be awaited.
//!
//! ## Design Notes
//!
//! - Mutating commands consult the [`CapabilityMap`] first and fail with
//!   [`ClientError::CommandDisabled`] without touching the network.
//! - Command responses are applied as deltas; `open` responses are
//!   reconciled as snapshots of the opened directory.
//! - A transport failure can schedule a background full resync
//!   (`client.sync_on_transport_error`).

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use remfs_cache::{CapabilityMap, DiffScope, EntryCache, HidePolicy, Reconciler};
use remfs_core::config::Config;
use remfs_core::domain::{ChangeSet, Command, CommandKind, Entry, EntryId, UploadFile};
use remfs_core::ports::{
    ClientEvent, ConflictAction, EventBus, IConflictResolver, ITransport, NormalizedResponse,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conflict::resolve_collisions;
use crate::dispatcher::{Dispatcher, RequestOptions};
use crate::engine::{SyncEngine, SyncOutcome, SyncScope};
use crate::notify::NotifyPolicy;
use crate::scheduler::{SyncScheduler, SyncTrigger};
use crate::upload::{FolderItem, UploadPipeline, UploadReport};
use crate::{ClientError, DispatchError};

/// Suffix the server appends when backing up names replaced by a paste
const PASTE_BACKUP_SUFFIX: &str = "~";

// ============================================================================
// Operation
// ============================================================================

/// A running command: cancel it or await its outcome
#[derive(Debug)]
pub struct Operation<T> {
    cancel: CancellationToken,
    task: JoinHandle<Result<T, ClientError>>,
}

impl<T> Operation<T> {
    /// Aborts every request of the operation quietly
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Waits for the command to finish
    pub async fn outcome(self) -> Result<T, ClientError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "Operation task failed");
                Err(DispatchError::Closed.into())
            }
        }
    }
}

// ============================================================================
// Browser
// ============================================================================

struct Inner {
    dispatcher: Dispatcher,
    cache: Arc<EntryCache>,
    reconciler: Reconciler,
    engine: Arc<SyncEngine>,
    uploads: UploadPipeline,
    events: EventBus,
    cwd: watch::Sender<Option<EntryId>>,
    config: Config,
    resolver: Option<Arc<dyn IConflictResolver>>,
    server: Mutex<ServerInfo>,
}

/// What the server reported about itself on `init`
#[derive(Debug, Clone, Default)]
struct ServerInfo {
    upload_max_size: Option<u64>,
    api: Option<String>,
}

/// Client-side state and command facade for one connector
#[derive(Clone)]
pub struct Browser {
    inner: Arc<Inner>,
}

impl Browser {
    /// Creates a browser without a conflict resolver
    ///
    /// Uploads and pastes into directories with colliding names then fail
    /// with [`crate::ConflictError::Unresolved`].
    pub fn new(transport: Arc<dyn ITransport>, config: Config) -> Self {
        Self::build(transport, config, None)
    }

    /// Creates a browser that asks `resolver` about name collisions
    pub fn with_conflict_resolver(
        transport: Arc<dyn ITransport>,
        config: Config,
        resolver: Arc<dyn IConflictResolver>,
    ) -> Self {
        Self::build(transport, config, Some(resolver))
    }

    fn build(
        transport: Arc<dyn ITransport>,
        config: Config,
        resolver: Option<Arc<dyn IConflictResolver>>,
    ) -> Self {
        let events = EventBus::new(config.client.event_capacity);
        let dispatcher = Dispatcher::new(transport, events.clone(), &config.dispatcher, &config.upload);
        let cache = Arc::new(EntryCache::with_hide_policy(
            HidePolicy::new().with_names(config.client.hidden_names.iter().cloned()),
        ));
        let reconciler = Reconciler::new(Arc::clone(&cache));
        let engine = Arc::new(SyncEngine::new(
            dispatcher.clone(),
            reconciler.clone(),
            config.sync.clone(),
        ));
        let mut uploads = UploadPipeline::new(dispatcher.clone(), reconciler.clone(), config.upload.clone());
        if let Some(resolver) = &resolver {
            uploads = uploads.with_resolver(Arc::clone(resolver));
        }
        let (cwd, _) = watch::channel(None);

        Self {
            inner: Arc::new(Inner {
                dispatcher,
                cache,
                reconciler,
                engine,
                uploads,
                events,
                cwd,
                config,
                resolver,
                server: Mutex::new(ServerInfo::default()),
            }),
        }
    }

    fn run<T, F, Fut>(&self, command: F) -> Operation<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Inner>, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let future = command(Arc::clone(&inner), cancel.clone());
        let task = tokio::spawn(async move {
            let result = future.await;
            if let Err(err) = &result {
                inner.after_failure(err);
            }
            result
        });
        Operation { cancel, task }
    }

    // ------------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------------

    /// Opens the default volume and learns the server's limits
    pub fn init(&self) -> Operation<EntryId> {
        self.run(|inner, cancel| async move { inner.open(None, true, &cancel).await })
    }

    /// Opens a directory and makes it the working directory
    pub fn open(&self, target: EntryId) -> Operation<EntryId> {
        self.run(|inner, cancel| async move { inner.open(Some(target), false, &cancel).await })
    }

    /// Names in a directory (`ls`), with ids when the connector reports them
    pub fn list(&self, target: EntryId) -> Operation<BTreeMap<String, Option<EntryId>>> {
        self.run(|inner, cancel| async move {
            inner.ensure_enabled(CommandKind::Ls, &target)?;
            let options = inner.options(CommandKind::Ls, &cancel).cwd_bound(inner.is_cwd(&target));
            let response = inner
                .dispatcher
                .execute(
                    Command::Ls {
                        target,
                        intersect: Vec::new(),
                    },
                    options,
                )
                .await?;
            Ok(response.listing)
        })
    }

    /// Subdirectories of a directory; returns the ids received
    pub fn tree(&self, target: EntryId) -> Operation<Vec<EntryId>> {
        self.run(|inner, cancel| async move {
            inner.ensure_enabled(CommandKind::Tree, &target)?;
            let options = inner.options(CommandKind::Tree, &cancel).cwd_bound(inner.is_cwd(&target));
            let response = inner
                .dispatcher
                .execute(Command::Tree { target }, options)
                .await?;
            Ok(inner.merge_listing(response.files))
        })
    }

    /// Ancestor chain of a directory, with siblings
    pub fn parents(&self, target: EntryId) -> Operation<Vec<EntryId>> {
        self.run(|inner, cancel| async move {
            let options = inner.options(CommandKind::Parents, &cancel);
            let response = inner
                .dispatcher
                .execute(Command::Parents { target }, options)
                .await?;
            Ok(inner.merge_listing(response.files))
        })
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Creates a directory; returns the created entries
    pub fn mkdir(&self, target: EntryId, name: impl Into<String>) -> Operation<Vec<Entry>> {
        let name = name.into();
        self.run(|inner, cancel| async move {
            inner.ensure_enabled(CommandKind::Mkdir, &target)?;
            let applied = inner
                .mutate(Command::Mkdir { target, name }, &cancel)
                .await?;
            Ok(applied.added)
        })
    }

    /// Creates an empty file; returns the created entries
    pub fn mkfile(&self, target: EntryId, name: impl Into<String>) -> Operation<Vec<Entry>> {
        let name = name.into();
        self.run(|inner, cancel| async move {
            inner.ensure_enabled(CommandKind::Mkfile, &target)?;
            let applied = inner
                .mutate(Command::Mkfile { target, name }, &cancel)
                .await?;
            Ok(applied.added)
        })
    }

    /// Renames an entry
    pub fn rename(&self, target: EntryId, name: impl Into<String>) -> Operation<ChangeSet> {
        let name = name.into();
        self.run(|inner, cancel| async move {
            inner.ensure_enabled(CommandKind::Rename, &target)?;
            inner.mutate(Command::Rename { target, name }, &cancel).await
        })
    }

    /// Removes entries; returns every id that left the cache
    pub fn rm(&self, targets: Vec<EntryId>) -> Operation<Vec<EntryId>> {
        self.run(|inner, cancel| async move {
            for target in &targets {
                inner.ensure_enabled(CommandKind::Rm, target)?;
            }
            let applied = inner.mutate(Command::Rm { targets }, &cancel).await?;
            Ok(applied.removed)
        })
    }

    /// Copies entries next to themselves; returns the copies
    pub fn duplicate(&self, targets: Vec<EntryId>) -> Operation<Vec<Entry>> {
        self.run(|inner, cancel| async move {
            for target in &targets {
                inner.ensure_enabled(CommandKind::Duplicate, target)?;
            }
            let applied = inner
                .mutate(Command::Duplicate { targets }, &cancel)
                .await?;
            Ok(applied.added)
        })
    }

    /// Copies (or with `cut`, moves) entries into `dst`
    ///
    /// Collisions in `dst` are settled first: `Skip` drops the source,
    /// `Rename` has the server back up the existing entry under a suffix,
    /// `Overwrite` replaces it.
    pub fn paste(&self, dst: EntryId, targets: Vec<EntryId>, cut: bool) -> Operation<ChangeSet> {
        self.run(move |inner, cancel| async move { inner.paste(dst, targets, cut, &cancel).await })
    }

    /// Uploads files into `target`
    pub fn upload(&self, items: Vec<UploadFile>, target: EntryId) -> Operation<UploadReport> {
        self.run(|inner, cancel| async move {
            inner.ensure_enabled(CommandKind::Upload, &target)?;
            let server_max = inner.upload_max_size(&target);
            inner
                .uploads
                .upload(items, &target, server_max, &cancel)
                .await
        })
    }

    /// Uploads a directory tree below `target`, creating missing directories
    pub fn upload_folder(&self, items: Vec<FolderItem>, target: EntryId) -> Operation<UploadReport> {
        self.run(|inner, cancel| async move {
            inner.ensure_enabled(CommandKind::Upload, &target)?;
            if items.iter().any(|item| !item.dirs.is_empty()) {
                inner.ensure_enabled(CommandKind::Mkdir, &target)?;
            }
            let server_max = inner.upload_max_size(&target);
            inner
                .uploads
                .upload_folder(items, &target, server_max, &cancel)
                .await
        })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Searches by name, optionally below `scope`; enters the search view
    pub fn search(&self, query: impl Into<String>, scope: Option<EntryId>) -> Operation<Vec<Entry>> {
        let query = query.into();
        self.run(|inner, cancel| async move {
            let options = inner.options(CommandKind::Search, &cancel);
            let response = inner
                .dispatcher
                .execute(
                    Command::Search {
                        query,
                        target: scope,
                    },
                    options,
                )
                .await?;

            inner.cache.set_search_view(true);
            let applied = inner.reconciler.apply_changes(ChangeSet {
                added: response.files.clone(),
                ..ChangeSet::default()
            });
            inner.events.publish_changes(&applied);
            Ok(response.files)
        })
    }

    /// Recursive size of entries (`size`)
    ///
    /// With a single id the result is also stored as that entry's
    /// aggregate size.
    pub fn get_aggregate_size(&self, ids: Vec<EntryId>) -> Operation<u64> {
        self.run(|inner, cancel| async move {
            let options = inner.options(CommandKind::Size, &cancel);
            let response = inner
                .dispatcher
                .execute(Command::Size { targets: ids.clone() }, options)
                .await?;
            let size = response.size.ok_or_else(|| {
                ClientError::InvalidResponse("size response without size".into())
            })?;

            if let [id] = ids.as_slice() {
                if let Some(mut entry) = inner.cache.get(id) {
                    entry.aggregate_size = Some(size);
                    inner.patch(vec![entry]);
                }
            }
            Ok(size)
        })
    }

    /// Generates thumbnails; dropped when the user navigates away
    pub fn thumbnails(&self, targets: Vec<EntryId>) -> Operation<BTreeMap<EntryId, String>> {
        self.run(|inner, cancel| async move {
            let options = inner.options(CommandKind::Tmb, &cancel);
            let response = inner
                .dispatcher
                .execute(Command::Tmb { targets }, options)
                .await?;

            let patched = response
                .thumbnails
                .iter()
                .filter_map(|(id, url)| {
                    let mut entry = inner.cache.get(id)?;
                    entry.thumbnail = Some(url.clone());
                    Some(entry)
                })
                .collect();
            inner.patch(patched);
            Ok(response.thumbnails)
        })
    }

    /// Refreshes metadata of cached entries
    pub fn info(&self, targets: Vec<EntryId>) -> Operation<Vec<Entry>> {
        self.run(|inner, cancel| async move {
            let options = inner.options(CommandKind::Info, &cancel);
            let response = inner
                .dispatcher
                .execute(Command::Info { targets }, options)
                .await?;
            inner.patch(response.files.clone());
            Ok(response.files)
        })
    }

    /// Syncs the working directory, or the whole cache with `full`
    pub fn sync(&self, full: bool) -> Operation<SyncOutcome> {
        self.run(move |inner, cancel| async move {
            let scope = match (full, inner.current_cwd()) {
                (false, Some(dir)) => SyncScope::Directory(dir),
                (_, cwd) => SyncScope::Full { cwd },
            };
            inner.engine.sync(scope, &cancel).await
        })
    }

    // ------------------------------------------------------------------------
    // Read-only accessors
    // ------------------------------------------------------------------------

    pub fn cache(&self) -> &Arc<EntryCache> {
        &self.inner.cache
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Current working directory
    pub fn cwd(&self) -> Option<EntryId> {
        self.inner.current_cwd()
    }

    /// Capabilities of the working directory and its children
    pub fn capabilities(&self) -> CapabilityMap {
        match self.inner.current_cwd() {
            Some(cwd) => CapabilityMap::resolve(&self.inner.cache, &cwd),
            None => CapabilityMap::default(),
        }
    }

    /// Connector API version reported on `init`
    pub fn api_version(&self) -> Option<String> {
        lock(&self.inner.server).api.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Scheduler running periodic syncs of the working directory
    pub fn scheduler(&self) -> (SyncScheduler, SyncTrigger) {
        SyncScheduler::new(
            Arc::clone(&self.inner.engine),
            self.inner.cwd.subscribe(),
            self.inner.config.sync.interval(),
        )
    }
}

fn lock(server: &Mutex<ServerInfo>) -> std::sync::MutexGuard<'_, ServerInfo> {
    server.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Indicator text for commands the user waits on
fn notify_message(kind: CommandKind) -> Option<&'static str> {
    let message = match kind {
        CommandKind::Open => "Opening folder",
        CommandKind::Mkdir => "Creating folder",
        CommandKind::Mkfile => "Creating file",
        CommandKind::Rename => "Renaming",
        CommandKind::Duplicate => "Duplicating",
        CommandKind::Rm => "Deleting",
        CommandKind::Paste => "Pasting",
        CommandKind::Search => "Searching",
        CommandKind::Size => "Calculating size",
        _ => return None,
    };
    Some(message)
}

impl Inner {
    fn current_cwd(&self) -> Option<EntryId> {
        self.cwd.borrow().clone()
    }

    fn is_cwd(&self, id: &EntryId) -> bool {
        self.cwd.borrow().as_ref() == Some(id)
    }

    fn options(&self, kind: CommandKind, cancel: &CancellationToken) -> RequestOptions {
        let options = RequestOptions::for_command(kind).cancel_token(cancel.clone());
        match notify_message(kind) {
            Some(message) => {
                options.notify(NotifyPolicy::new(self.config.dispatcher.notify_delay(), message))
            }
            None => options,
        }
    }

    /// Fails when the capability map disables `kind` for `target`
    fn ensure_enabled(&self, kind: CommandKind, target: &EntryId) -> Result<(), ClientError> {
        let context = self
            .cache
            .get(target)
            .and_then(|entry| entry.parent_id)
            .unwrap_or_else(|| target.clone());
        let map = CapabilityMap::resolve(&self.cache, &context);
        if map.is_command_enabled(kind, target) {
            Ok(())
        } else {
            debug!(command = %kind, %target, "Command disabled");
            Err(ClientError::CommandDisabled {
                command: kind,
                target: target.clone(),
            })
        }
    }

    /// Largest request the server accepts for uploads into `target`
    fn upload_max_size(&self, target: &EntryId) -> Option<u64> {
        let reported = lock(&self.server).upload_max_size;
        let volume = self
            .cache
            .root_of(target)
            .and_then(|root| root.volume_options)
            .and_then(|options| options.upload_max_size);
        match (reported, volume) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn open(
        &self,
        target: Option<EntryId>,
        init: bool,
        cancel: &CancellationToken,
    ) -> Result<EntryId, ClientError> {
        if let Some(target) = &target {
            self.ensure_enabled(CommandKind::Open, target)?;
        }
        let response = self
            .dispatcher
            .execute(
                Command::Open {
                    target,
                    init,
                    tree: init,
                    compare: None,
                },
                self.options(CommandKind::Open, cancel),
            )
            .await?;

        if init {
            let mut server = lock(&self.server);
            server.upload_max_size = response.upload_max_size;
            server.api = response.api.clone();
            info!(api = ?server.api, upload_max_size = ?server.upload_max_size, "Connector initialised");
        }

        let Some(cwd) = response.cwd else {
            return Err(ClientError::InvalidResponse("open response has no cwd".into()));
        };
        let cwd_id = cwd.id.clone();
        let mut incoming = response.files;
        incoming.push(cwd);

        self.cache.set_search_view(false);
        let applied = self.reconciler.reconcile(
            &incoming,
            &DiffScope::Children(cwd_id.clone()),
            &self.config.sync.excluded_fields,
        );
        self.events.publish_changes(&applied);
        self.cwd.send_replace(Some(cwd_id.clone()));
        debug!(cwd = %cwd_id, "Working directory changed");
        Ok(cwd_id)
    }

    /// Sends a mutating command and applies its delta
    async fn mutate(
        &self,
        command: Command,
        cancel: &CancellationToken,
    ) -> Result<ChangeSet, ClientError> {
        let options = self.options(command.kind(), cancel);
        let response = self.dispatcher.execute(command, options).await?;
        Ok(self.apply_delta(response))
    }

    fn apply_delta(&self, response: NormalizedResponse) -> ChangeSet {
        let applied = self.reconciler.apply_changes(ChangeSet {
            added: response.added,
            removed: response.removed,
            changed: response.changed,
        });
        self.events.publish_changes(&applied);
        applied
    }

    /// Merges listing records (tree, parents) without removing anything
    fn merge_listing(&self, files: Vec<Entry>) -> Vec<EntryId> {
        let ids = files.iter().map(|e| e.id.clone()).collect();
        let applied = self.reconciler.apply_changes(ChangeSet {
            added: files,
            ..ChangeSet::default()
        });
        self.events.publish_changes(&applied);
        ids
    }

    fn patch(&self, entries: Vec<Entry>) {
        let patched = self.cache.apply_field_patch(entries);
        if !patched.is_empty() {
            self.events.emit(ClientEvent::EntriesChanged(patched));
        }
    }

    async fn paste(
        &self,
        dst: EntryId,
        targets: Vec<EntryId>,
        cut: bool,
        cancel: &CancellationToken,
    ) -> Result<ChangeSet, ClientError> {
        self.ensure_enabled(CommandKind::Paste, &dst)?;
        if cut {
            for target in &targets {
                let context = self
                    .cache
                    .get(target)
                    .and_then(|entry| entry.parent_id)
                    .unwrap_or_else(|| target.clone());
                if !CapabilityMap::resolve(&self.cache, &context).is_cut_enabled(target) {
                    return Err(ClientError::CommandDisabled {
                        command: CommandKind::Paste,
                        target: target.clone(),
                    });
                }
            }
        }

        let named: Vec<(EntryId, String)> = targets
            .into_iter()
            .map(|id| {
                let name = self.cache.resolve_name(&id).unwrap_or_else(|| id.to_string());
                (id, name)
            })
            .collect();
        let mut names: Vec<String> = named.iter().map(|(_, name)| name.clone()).collect();
        names.sort();
        names.dedup();

        let existing = self
            .dispatcher
            .execute(
                Command::Ls {
                    target: dst.clone(),
                    intersect: names,
                },
                RequestOptions::for_command(CommandKind::Ls).cancel_token(cancel.clone()),
            )
            .await?
            .listing;
        let mut seen = HashSet::new();
        let collisions = named
            .iter()
            .filter(|(_, name)| seen.insert(name.as_str()))
            .filter_map(|(_, name)| existing.get(name).map(|id| (name.clone(), id.clone())))
            .collect();
        let decisions =
            resolve_collisions(self.resolver.as_deref(), CommandKind::Paste, &dst, collisions)
                .await?;

        let mut targets = Vec::with_capacity(named.len());
        let mut renames = Vec::new();
        for (id, name) in named {
            match decisions.get(&name) {
                Some(ConflictAction::Skip) | Some(ConflictAction::Cancel) => {
                    debug!(%name, "Paste skips colliding name");
                }
                Some(ConflictAction::Rename) => {
                    if !renames.contains(&name) {
                        renames.push(name);
                    }
                    targets.push(id);
                }
                Some(ConflictAction::Overwrite) | None => targets.push(id),
            }
        }
        if targets.is_empty() {
            return Ok(ChangeSet::default());
        }

        let suffix = (!renames.is_empty()).then(|| PASTE_BACKUP_SUFFIX.to_string());
        self.mutate(
            Command::Paste {
                dst,
                targets,
                cut,
                renames,
                suffix,
            },
            cancel,
        )
        .await
    }

    /// Schedules a background full resync after a network failure
    fn after_failure(self: &Arc<Self>, err: &ClientError) {
        if !err.is_transport() || !self.config.client.sync_on_transport_error {
            return;
        }
        let inner = Arc::clone(self);
        warn!(error = %err, "Transport failure, scheduling full resync");
        tokio::spawn(async move {
            let scope = SyncScope::Full {
                cwd: inner.current_cwd(),
            };
            if let Err(err) = inner.engine.sync(scope, &CancellationToken::new()).await {
                warn!(error = %err, "Background resync failed");
            }
        });
    }
}
