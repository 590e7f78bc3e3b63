//! In-memory entry store
//!
//! [`EntryCache`] mirrors every entry the connector has reported, indexed by
//! id, by parent, and in a separate store for entries the user chose to hide.
//!
//! ## Invariants
//!
//! - `children[p]` is exactly the set of visible entries whose parent is `p`;
//!   `hidden_children[p]` is the same for hidden entries.
//! - No entry is its own parent, and no parent chain loops back to its
//!   origin. Offending records are rejected before they touch the indexes
//!   and recorded as [`StructuralError`]s.
//! - A record replacing a cached one drops every field the new payload
//!   omits, except derived fields (see [`Entry::inherit_derived`]).
//!
//! ## Concurrency
//!
//! All indexes live behind one `RwLock`. Every public mutation, and every
//! reconciliation in [`crate::reconcile`], runs inside a single write
//! section, so readers never observe a half-applied batch.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use remfs_core::domain::{ChangeKind, CompareToken, Entry, EntryId, StructuralError};
use tracing::{debug, warn};

// ============================================================================
// Policies
// ============================================================================

/// Whether removing a directory also removes its cached descendants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovePolicy {
    /// Remove every descendant reachable through the children index
    Cascade,
    /// Remove only the named ids (used while a search view is active, where
    /// results from unrelated volumes must survive)
    NoCascade,
}

/// User-level filter moving matching entries out of normal listings
///
/// Hidden entries are kept in a side store so their names still resolve
/// (for example in error messages). Volume roots are never hidden.
#[derive(Debug, Clone, Default)]
pub struct HidePolicy {
    names: HashSet<String>,
    ids: HashSet<EntryId>,
}

impl HidePolicy {
    /// Policy hiding nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Hide entries with any of the given names
    #[must_use]
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Hide one specific entry
    #[must_use]
    pub fn with_id(mut self, id: EntryId) -> Self {
        self.ids.insert(id);
        self
    }

    /// Whether the policy hides `entry`
    pub fn hides(&self, entry: &Entry) -> bool {
        !entry.is_root() && (self.ids.contains(&entry.id) || self.names.contains(&entry.name))
    }
}

// ============================================================================
// Scope
// ============================================================================

/// Portion of the cache a snapshot or diff covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffScope {
    /// Every cached entry
    All,
    /// Direct children of one directory
    Children(EntryId),
}

impl DiffScope {
    /// Whether `entry` falls inside the scope
    pub fn contains(&self, entry: &Entry) -> bool {
        match self {
            DiffScope::All => true,
            DiffScope::Children(parent) => entry.parent_id.as_ref() == Some(parent),
        }
    }
}

// ============================================================================
// CacheState
// ============================================================================

/// Parents declared by the batch currently being ingested
pub(crate) type BatchParents = HashMap<EntryId, Option<EntryId>>;

/// Build the parent map of a batch so cycle checks see in-flight moves
pub(crate) fn batch_parents<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> BatchParents {
    entries
        .into_iter()
        .map(|e| (e.id.clone(), e.parent_id.clone()))
        .collect()
}

/// Indexes guarded by the cache lock
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    by_id: HashMap<EntryId, Entry>,
    children: HashMap<EntryId, BTreeSet<EntryId>>,
    hidden: HashMap<EntryId, Entry>,
    hidden_children: HashMap<EntryId, BTreeSet<EntryId>>,
    hide_policy: HidePolicy,
    search_view: bool,
    structural_errors: Vec<StructuralError>,
}

impl CacheState {
    pub(crate) fn visible(&self, id: &EntryId) -> Option<&Entry> {
        self.by_id.get(id)
    }

    /// Visible or hidden record
    pub(crate) fn lookup(&self, id: &EntryId) -> Option<&Entry> {
        self.by_id.get(id).or_else(|| self.hidden.get(id))
    }

    /// Every record, visible and hidden
    pub(crate) fn all_entries(&self) -> impl Iterator<Item = &Entry> {
        self.by_id.values().chain(self.hidden.values())
    }

    pub(crate) fn removal_policy(&self) -> RemovePolicy {
        if self.search_view {
            RemovePolicy::NoCascade
        } else {
            RemovePolicy::Cascade
        }
    }

    pub(crate) fn record(&mut self, err: StructuralError) {
        warn!(id = %err.entry_id(), error = %err, "Rejected structurally invalid entry");
        self.structural_errors.push(err);
    }

    fn parent_of(&self, id: &EntryId, batch: &BatchParents) -> Option<Option<EntryId>> {
        if let Some(parent) = batch.get(id) {
            return Some(parent.clone());
        }
        self.lookup(id).map(|e| e.parent_id.clone())
    }

    /// Reject self-parenting and parent chains that lead back to the entry
    pub(crate) fn check_structure(
        &self,
        entry: &Entry,
        batch: &BatchParents,
    ) -> Result<(), StructuralError> {
        let Some(parent) = entry.parent_id.as_ref() else {
            return Ok(());
        };

        if parent == &entry.id {
            return Err(StructuralError::SelfParent {
                id: entry.id.clone(),
            });
        }

        let mut visited = HashSet::new();
        let mut current = parent.clone();
        loop {
            if current == entry.id {
                return Err(StructuralError::Cycle {
                    id: entry.id.clone(),
                    parent: parent.clone(),
                });
            }
            // A loop elsewhere in the chain does not involve this entry
            if !visited.insert(current.clone()) {
                return Ok(());
            }
            match self.parent_of(&current, batch) {
                Some(Some(next)) => current = next,
                _ => return Ok(()),
            }
        }
    }

    fn attach(&mut self, entry: &Entry) {
        if let Some(parent) = &entry.parent_id {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(entry.id.clone());
        }
    }

    fn detach(&mut self, entry: &Entry) {
        if let Some(parent) = &entry.parent_id {
            if let Some(set) = self.children.get_mut(parent) {
                set.remove(&entry.id);
                if set.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
    }

    fn hide(&mut self, entry: Entry) {
        if let Some(parent) = &entry.parent_id {
            self.hidden_children
                .entry(parent.clone())
                .or_default()
                .insert(entry.id.clone());
        }
        self.hidden.insert(entry.id.clone(), entry);
    }

    fn unhide(&mut self, id: &EntryId) -> Option<Entry> {
        let entry = self.hidden.remove(id)?;
        if let Some(parent) = &entry.parent_id {
            if let Some(set) = self.hidden_children.get_mut(parent) {
                set.remove(id);
                if set.is_empty() {
                    self.hidden_children.remove(parent);
                }
            }
        }
        Some(entry)
    }

    /// Insert or replace one record
    ///
    /// Returns the stored record when it is visible, `None` when the hide
    /// policy moved it to the hidden store.
    pub(crate) fn upsert_one(
        &mut self,
        mut entry: Entry,
        batch: &BatchParents,
    ) -> Result<Option<Entry>, StructuralError> {
        self.check_structure(&entry, batch)?;

        if let Some(previous) = self.by_id.remove(&entry.id) {
            self.detach(&previous);
            entry.inherit_derived(&previous);
        } else if let Some(previous) = self.unhide(&entry.id) {
            entry.inherit_derived(&previous);
        }

        if self.hide_policy.hides(&entry) {
            self.hide(entry);
            return Ok(None);
        }

        self.attach(&entry);
        self.by_id.insert(entry.id.clone(), entry.clone());
        Ok(Some(entry))
    }

    /// Remove ids (and, with [`RemovePolicy::Cascade`], their descendants)
    ///
    /// Returns the visible ids removed, named ids first.
    pub(crate) fn remove_ids(&mut self, ids: &[EntryId], policy: RemovePolicy) -> Vec<EntryId> {
        let mut removed = Vec::new();
        let mut seen = HashSet::new();

        for id in ids {
            let mut stack = vec![id.clone()];
            while let Some(current) = stack.pop() {
                if !seen.insert(current.clone()) {
                    continue;
                }
                if policy == RemovePolicy::Cascade {
                    if let Some(children) = self.hidden_children.get(&current) {
                        stack.extend(children.iter().rev().cloned());
                    }
                    if let Some(children) = self.children.get(&current) {
                        stack.extend(children.iter().rev().cloned());
                    }
                }
                if let Some(entry) = self.by_id.remove(&current) {
                    self.detach(&entry);
                    removed.push(current);
                } else {
                    self.unhide(&current);
                }
            }
        }

        removed
    }

    fn children_sorted(&self, parent: &EntryId) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .children
            .get(parent)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect();
        entries.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.cmp(&b.name))
        });
        entries
    }

    fn repartition(&mut self) {
        let entries: Vec<Entry> = self
            .by_id
            .drain()
            .chain(self.hidden.drain())
            .map(|(_, e)| e)
            .collect();
        self.children.clear();
        self.hidden_children.clear();
        for entry in entries {
            if self.hide_policy.hides(&entry) {
                self.hide(entry);
            } else {
                self.attach(&entry);
                self.by_id.insert(entry.id.clone(), entry);
            }
        }
    }
}

// ============================================================================
// EntryCache
// ============================================================================

/// Process-wide mirror of the remote namespace
///
/// Shared as `Arc<EntryCache>`. Reads clone records out of the lock;
/// mutations go through [`EntryCache::upsert`], [`EntryCache::remove`],
/// [`EntryCache::apply_field_patch`] or the [`crate::Reconciler`].
///
/// # Example
///
/// ```rust
/// use remfs_cache::EntryCache;
/// use remfs_core::domain::{ChangeKind, Entry, EntryId, VolumeOptions};
///
/// let cache = EntryCache::new();
/// let root = EntryId::new("v1_Lw").unwrap();
/// cache.upsert(
///     vec![
///         Entry::root(root.clone(), "Home", VolumeOptions::default()),
///         Entry::file(EntryId::new("v1_YQ").unwrap(), root.clone(), "a.txt"),
///     ],
///     ChangeKind::Snapshot,
/// );
/// assert_eq!(cache.children_of(&root).len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct EntryCache {
    state: RwLock<CacheState>,
}

impl EntryCache {
    /// Creates an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache with a hide policy
    pub fn with_hide_policy(policy: HidePolicy) -> Self {
        let cache = Self::new();
        cache.write().hide_policy = policy;
        cache
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Insert or merge entries
    ///
    /// Records that would break the tree structure are skipped and recorded
    /// (see [`EntryCache::take_structural_errors`]); this never fails.
    pub fn upsert(&self, entries: Vec<Entry>, kind: ChangeKind) {
        let mut state = self.write();
        let batch = batch_parents(&entries);
        let count = entries.len();
        for entry in entries {
            if let Err(err) = state.upsert_one(entry, &batch) {
                state.record(err);
            }
        }
        debug!(count, ?kind, "Upserted entries");
    }

    /// Remove entries using the policy implied by the search-view flag
    ///
    /// Returns the visible ids removed, including cascaded descendants.
    pub fn remove(&self, ids: &[EntryId]) -> Vec<EntryId> {
        let mut state = self.write();
        let policy = state.removal_policy();
        state.remove_ids(ids, policy)
    }

    /// Remove entries with an explicit cascade policy
    pub fn remove_with(&self, ids: &[EntryId], policy: RemovePolicy) -> Vec<EntryId> {
        self.write().remove_ids(ids, policy)
    }

    /// Replace metadata of already cached entries
    ///
    /// Uses the same missing-field-deletes-field rule as [`EntryCache::upsert`].
    /// Records for unknown ids are ignored. Returns the ids patched.
    pub fn apply_field_patch(&self, changed: Vec<Entry>) -> Vec<EntryId> {
        let mut state = self.write();
        let batch = batch_parents(&changed);
        let mut patched = Vec::new();
        for entry in changed {
            if state.lookup(&entry.id).is_none() {
                continue;
            }
            let id = entry.id.clone();
            match state.upsert_one(entry, &batch) {
                Ok(_) => patched.push(id),
                Err(err) => state.record(err),
            }
        }
        patched
    }

    /// Set or clear the search-view flag (suppresses cascading removal)
    pub fn set_search_view(&self, active: bool) {
        self.write().search_view = active;
    }

    /// Whether a search view is active
    pub fn is_search_view(&self) -> bool {
        self.read().search_view
    }

    /// Replace the hide policy and re-sort existing entries accordingly
    pub fn set_hide_policy(&self, policy: HidePolicy) {
        let mut state = self.write();
        state.hide_policy = policy;
        state.repartition();
    }

    /// Drain the structural errors recorded since the last call
    pub fn take_structural_errors(&self) -> Vec<StructuralError> {
        std::mem::take(&mut self.write().structural_errors)
    }

    /// Forget everything (used before re-initialisation)
    pub fn clear(&self) {
        let mut state = self.write();
        state.by_id.clear();
        state.children.clear();
        state.hidden.clear();
        state.hidden_children.clear();
        state.search_view = false;
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Visible entry by id
    pub fn get(&self, id: &EntryId) -> Option<Entry> {
        self.read().visible(id).cloned()
    }

    /// Whether a visible entry exists
    pub fn contains(&self, id: &EntryId) -> bool {
        self.read().visible(id).is_some()
    }

    /// Number of visible entries
    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    /// Whether no visible entry is cached
    pub fn is_empty(&self) -> bool {
        self.read().by_id.is_empty()
    }

    /// Visible children of a directory, directories first, then by name
    pub fn children_of(&self, id: &EntryId) -> Vec<Entry> {
        self.read().children_sorted(id)
    }

    /// Path from the volume root down to `id` (inclusive)
    ///
    /// Stops at the first entry flagged as a volume root even if it names a
    /// further parent. Empty when `id` is not cached.
    pub fn ancestors_of(&self, id: &EntryId) -> Vec<Entry> {
        let state = self.read();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = state.visible(id);

        while let Some(entry) = current {
            if !seen.insert(entry.id.clone()) {
                break;
            }
            chain.push(entry.clone());
            if entry.is_root() {
                break;
            }
            current = entry.parent_id.as_ref().and_then(|p| state.visible(p));
        }

        chain.reverse();
        chain
    }

    /// Volume root above `id`, if cached
    pub fn root_of(&self, id: &EntryId) -> Option<Entry> {
        self.ancestors_of(id).into_iter().next().filter(Entry::is_root)
    }

    /// Every visible entry within `scope`
    pub fn snapshot(&self, scope: &DiffScope) -> Vec<Entry> {
        self.read()
            .by_id
            .values()
            .filter(|e| scope.contains(e))
            .cloned()
            .collect()
    }

    /// Names of the visible and hidden children of `parent`
    pub fn child_names(&self, parent: &EntryId) -> HashSet<String> {
        let state = self.read();
        state
            .all_entries()
            .filter(|e| e.parent_id.as_ref() == Some(parent))
            .map(|e| e.name.clone())
            .collect()
    }

    /// Visible child of `parent` called `name`
    pub fn find_child_by_name(&self, parent: &EntryId, name: &str) -> Option<Entry> {
        let state = self.read();
        state
            .children
            .get(parent)?
            .iter()
            .filter_map(|id| state.visible(id))
            .find(|e| e.name == name)
            .cloned()
    }

    /// Name of a visible or hidden entry
    pub fn resolve_name(&self, id: &EntryId) -> Option<String> {
        self.read().lookup(id).map(|e| e.name.clone())
    }

    /// Whether `id` is held in the hidden store
    pub fn is_hidden(&self, id: &EntryId) -> bool {
        self.read().hidden.contains_key(id)
    }

    /// Fingerprint of the cached children of `dir`
    pub fn compare_token(&self, dir: &EntryId) -> CompareToken {
        let state = self.read();
        let children: Vec<&Entry> = state
            .children
            .get(dir)
            .into_iter()
            .flatten()
            .filter_map(|id| state.visible(id))
            .collect();
        let newest = children.iter().filter_map(|e| e.modified).max();
        CompareToken::new(children.len(), newest)
    }
}
