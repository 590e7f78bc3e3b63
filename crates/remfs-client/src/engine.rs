//! Sync engine
//!
//! The [`SyncEngine`] brings the entry cache back in line with the server.
//!
//! ## Sync Flow
//!
//! 1. **Announce**: emit `SyncStarted` for the scope
//! 2. **Fetch**: `open` the directory with a compare token (child count and
//!    newest mtime of the cached listing); a full resync asks for the tree
//!    and the ancestor chain instead
//! 3. **Short-circuit**: a server reporting the token unchanged ends the
//!    cycle without touching the cache
//! 4. **Reconcile**: diff the snapshot against the scope (directory children,
//!    or the whole cache), apply it in one write section and publish the
//!    triple as removed, added, changed
//! 5. **Finish**: emit `SyncFinished`, also when the cycle failed

use remfs_cache::{DiffScope, Reconciler};
use remfs_core::config::SyncConfig;
use remfs_core::domain::{ChangeSet, Command, CommandKind, Entry, EntryId};
use remfs_core::ports::{ClientEvent, EventBus, NormalizedResponse};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::dispatcher::{Dispatcher, RequestOptions};
use crate::ClientError;

/// What a sync cycle covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    /// The direct children of one directory
    Directory(EntryId),
    /// The whole cache, anchored at the working directory if there is one
    Full { cwd: Option<EntryId> },
}

impl SyncScope {
    /// Directory named in `SyncStarted`/`SyncFinished` (`None` = whole tree)
    pub fn directory(&self) -> Option<&EntryId> {
        match self {
            SyncScope::Directory(dir) => Some(dir),
            SyncScope::Full { .. } => None,
        }
    }
}

/// Result of one sync cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The server confirmed the compare token; nothing was fetched
    Unchanged,
    /// The snapshot was reconciled; the change set may be empty
    Applied(ChangeSet),
}

impl SyncOutcome {
    /// Whether the cache was mutated
    pub fn changed(&self) -> bool {
        matches!(self, SyncOutcome::Applied(changes) if !changes.is_empty())
    }
}

/// Runs sync cycles against the shared cache
#[derive(Debug, Clone)]
pub struct SyncEngine {
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    events: EventBus,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(dispatcher: Dispatcher, reconciler: Reconciler, config: SyncConfig) -> Self {
        Self {
            events: dispatcher.events().clone(),
            dispatcher,
            reconciler,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs one sync cycle
    ///
    /// # Arguments
    /// * `scope` - Directory or full resync
    /// * `cancel` - Aborts the cycle's requests quietly
    ///
    /// # Errors
    /// Returns the dispatch error of a failed request, or
    /// [`ClientError::InvalidResponse`] when the server omits the directory
    #[instrument(skip(self, cancel))]
    pub async fn sync(
        &self,
        scope: SyncScope,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, ClientError> {
        let label = scope.directory().cloned();
        self.events.emit(ClientEvent::SyncStarted {
            scope: label.clone(),
        });

        let result = match &scope {
            SyncScope::Directory(dir) => self.sync_directory(dir, cancel).await,
            SyncScope::Full { cwd } => self.sync_full(cwd.as_ref(), cancel).await,
        };

        let changed = result.as_ref().is_ok_and(SyncOutcome::changed);
        self.events.emit(ClientEvent::SyncFinished {
            scope: label,
            changed,
        });
        result
    }

    async fn sync_directory(
        &self,
        dir: &EntryId,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, ClientError> {
        let compare = self
            .config
            .use_compare_token
            .then(|| self.reconciler.cache().compare_token(dir));
        let response = self
            .dispatcher
            .execute(
                Command::Open {
                    target: Some(dir.clone()),
                    init: false,
                    tree: false,
                    compare,
                },
                self.options(CommandKind::Open, cancel),
            )
            .await?;

        if response.unchanged {
            debug!(%dir, "Directory unchanged");
            return Ok(SyncOutcome::Unchanged);
        }

        let incoming = snapshot(response, Vec::new())?;
        Ok(SyncOutcome::Applied(
            self.apply(&incoming, &DiffScope::Children(dir.clone())),
        ))
    }

    async fn sync_full(
        &self,
        cwd: Option<&EntryId>,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, ClientError> {
        let open = self.dispatcher.execute(
            Command::Open {
                target: cwd.cloned(),
                init: cwd.is_none(),
                tree: true,
                compare: None,
            },
            self.options(CommandKind::Open, cancel),
        );

        let (opened, ancestors) = match cwd {
            Some(dir) => {
                let parents = self.dispatcher.execute(
                    Command::Parents {
                        target: dir.clone(),
                    },
                    self.options(CommandKind::Parents, cancel),
                );
                let (opened, parents) = tokio::join!(open, parents);
                (opened?, parents?.files)
            }
            None => (open.await?, Vec::new()),
        };

        let incoming = snapshot(opened, ancestors)?;
        info!(entries = incoming.len(), "Full resync snapshot received");
        Ok(SyncOutcome::Applied(self.apply(&incoming, &DiffScope::All)))
    }

    fn apply(&self, incoming: &[Entry], scope: &DiffScope) -> ChangeSet {
        let applied = self
            .reconciler
            .reconcile(incoming, scope, &self.config.excluded_fields);
        self.events.publish_changes(&applied);
        applied
    }

    /// Background requests: never navigation, never cwd-bound
    fn options(&self, kind: CommandKind, cancel: &CancellationToken) -> RequestOptions {
        RequestOptions::for_command(kind)
            .navigation(false)
            .cwd_bound(false)
            .cancel_token(cancel.clone())
    }
}

/// Collects the entries of an `open` response plus extra records
fn snapshot(response: NormalizedResponse, extra: Vec<Entry>) -> Result<Vec<Entry>, ClientError> {
    let Some(cwd) = response.cwd else {
        return Err(ClientError::InvalidResponse(
            "open response has no cwd".into(),
        ));
    };
    let mut incoming = Vec::with_capacity(response.files.len() + extra.len() + 1);
    incoming.push(cwd);
    incoming.extend(response.files);
    incoming.extend(extra);
    Ok(incoming)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dir, file, id, root, MockReply, MockTransport};
    use crate::DispatchError;
    use remfs_cache::EntryCache;
    use remfs_core::config::{DispatcherConfig, UploadConfig};
    use remfs_core::domain::{ChangeKind, CompareToken};
    use remfs_core::ports::{TransportError, TransportRequest};
    use std::sync::Arc;

    fn engine(transport: Arc<MockTransport>, config: SyncConfig) -> (SyncEngine, Arc<EntryCache>) {
        let cache = Arc::new(EntryCache::new());
        cache.upsert(
            vec![
                root("v1"),
                dir("d1", "v1"),
                file("a", "d1"),
                file("b", "d1"),
                dir("d2", "v1"),
                file("x", "d2"),
            ],
            ChangeKind::Snapshot,
        );
        let dispatcher = Dispatcher::new(
            transport,
            EventBus::default(),
            &DispatcherConfig::default(),
            &UploadConfig::default(),
        );
        let engine = SyncEngine::new(dispatcher, Reconciler::new(Arc::clone(&cache)), config);
        (engine, cache)
    }

    fn compare_sent(req: &TransportRequest) -> Option<CompareToken> {
        match &req.command {
            Command::Open { compare, .. } => *compare,
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_token_short_circuits() {
        let transport = MockTransport::new(|_, _| {
            MockReply::ok(NormalizedResponse {
                unchanged: true,
                ..NormalizedResponse::default()
            })
        });
        let (engine, cache) = engine(transport.clone(), SyncConfig::default());
        let mut rx = engine.events.subscribe();
        let expected = cache.compare_token(&id("d1"));

        let outcome = engine
            .sync(SyncScope::Directory(id("d1")), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Unchanged);
        assert_eq!(compare_sent(&transport.requests()[0]), Some(expected));
        assert_eq!(cache.len(), 6);
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::SyncStarted {
                scope: Some(id("d1"))
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::SyncFinished {
                scope: Some(id("d1")),
                changed: false
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_directory_sync_publishes_in_order() {
        let transport = MockTransport::new(|_, _| {
            MockReply::ok(NormalizedResponse {
                cwd: Some(dir("d1", "v1")),
                files: vec![file("b", "d1"), file("c", "d1")],
                ..NormalizedResponse::default()
            })
        });
        let (engine, cache) = engine(transport, SyncConfig::default());
        let mut rx = engine.events.subscribe();

        let outcome = engine
            .sync(SyncScope::Directory(id("d1")), &CancellationToken::new())
            .await
            .unwrap();

        let SyncOutcome::Applied(changes) = outcome else {
            panic!("expected applied changes");
        };
        assert_eq!(changes.removed, vec![id("a")]);
        assert_eq!(changes.added_ids(), vec![id("c")]);
        assert!(cache.contains(&id("x")));

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            events,
            vec![
                ClientEvent::SyncStarted {
                    scope: Some(id("d1"))
                },
                ClientEvent::EntriesRemoved(vec![id("a")]),
                ClientEvent::EntriesAdded(vec![id("c")]),
                ClientEvent::SyncFinished {
                    scope: Some(id("d1")),
                    changed: true
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_token_can_be_disabled() {
        let transport = MockTransport::new(|_, _| {
            MockReply::ok(NormalizedResponse {
                cwd: Some(dir("d1", "v1")),
                files: vec![file("a", "d1"), file("b", "d1")],
                ..NormalizedResponse::default()
            })
        });
        let config = SyncConfig {
            use_compare_token: false,
            ..SyncConfig::default()
        };
        let (engine, _) = engine(transport.clone(), config);

        let outcome = engine
            .sync(SyncScope::Directory(id("d1")), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.changed());
        assert_eq!(compare_sent(&transport.requests()[0]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sync_covers_whole_cache() {
        let transport = MockTransport::new(|req, _| {
            let response = match &req.command {
                Command::Open { tree: true, .. } => NormalizedResponse {
                    cwd: Some(dir("d1", "v1")),
                    files: vec![file("a", "d1"), root("v1"), dir("d2", "v1")],
                    ..NormalizedResponse::default()
                },
                Command::Parents { .. } => NormalizedResponse {
                    files: vec![root("v1"), dir("d1", "v1"), dir("d2", "v1")],
                    ..NormalizedResponse::default()
                },
                _ => NormalizedResponse::default(),
            };
            MockReply::ok(response)
        });
        let (engine, cache) = engine(transport.clone(), SyncConfig::default());

        let outcome = engine
            .sync(
                SyncScope::Full {
                    cwd: Some(id("d1")),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let SyncOutcome::Applied(changes) = outcome else {
            panic!("expected applied changes");
        };
        assert_eq!(changes.removed, vec![id("b"), id("x")]);
        assert!(!cache.contains(&id("x")));
        assert!(cache.contains(&id("d2")));
        assert_eq!(transport.count(CommandKind::Parents), 1);
        assert!(transport
            .requests()
            .iter()
            .all(|r| compare_sent(r).is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sync_still_finishes() {
        let transport =
            MockTransport::new(|_, _| MockReply::err(TransportError::Network("down".into())));
        let (engine, cache) = engine(transport, SyncConfig::default());
        let mut rx = engine.events.subscribe();

        let err = engine
            .sync(SyncScope::Directory(id("d1")), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_transport());
        assert_eq!(cache.len(), 6);
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(events.first(), Some(ClientEvent::SyncStarted { .. })));
        assert_eq!(
            events.last(),
            Some(&ClientEvent::SyncFinished {
                scope: Some(id("d1")),
                changed: false
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_cwd_is_invalid() {
        let transport = MockTransport::new(|_, _| MockReply::ok(NormalizedResponse::default()));
        let (engine, cache) = engine(transport, SyncConfig::default());

        let err = engine
            .sync(SyncScope::Directory(id("d1")), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::InvalidResponse(_)));
        assert!(cache.contains(&id("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_sync_is_quiet() {
        let transport = MockTransport::slow(std::time::Duration::from_secs(5));
        let (engine, _) = engine(transport, SyncConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine
            .sync(SyncScope::Directory(id("d1")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Dispatch(DispatchError::Aborted { quiet: true })
        ));
    }
}
