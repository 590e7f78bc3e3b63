//! Snapshot reconciliation
//!
//! Turns an authoritative server snapshot into the minimal set of cache
//! mutations. [`diff`] is pure and works on any view of the cache;
//! [`Reconciler`] computes and applies it against an [`EntryCache`] in one
//! write section.
//!
//! ## Algorithm
//!
//! 1. Index the incoming records by id.
//! 2. Every cached id inside the scope that the snapshot does not mention is
//!    removed.
//! 3. Every incoming id the cache does not know is added; known ids are
//!    compared field by field and changed on any difference.
//! 4. A removed directory whose parent survives and is part of the snapshot
//!    marks that parent changed (its `has_subdirs` rendering may flip).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use remfs_core::domain::{ChangeSet, Entry, EntryField, EntryId};
use tracing::{debug, instrument};

use crate::store::{batch_parents, CacheState, DiffScope, EntryCache};

// ============================================================================
// Pure diff
// ============================================================================

/// Whether two records differ in any compared field
///
/// Derived fields never count as a difference.
pub fn entries_differ(cached: &Entry, incoming: &Entry, excluded: &[EntryField]) -> bool {
    EntryField::ALL
        .iter()
        .filter(|f| !f.is_derived() && !excluded.contains(f))
        .any(|f| cached.differs_in(incoming, *f))
}

/// Compute the change set turning `cached` into `incoming`
///
/// # Arguments
///
/// * `cached` - Current cache view (visible and hidden records)
/// * `incoming` - Authoritative records from the server
/// * `scope` - Which cached records the snapshot is authoritative for
/// * `excluded` - Fields ignored when comparing known records
///
/// The returned sets are disjoint; `removed` is sorted.
pub fn diff<'a>(
    cached: impl IntoIterator<Item = &'a Entry>,
    incoming: &[Entry],
    scope: &DiffScope,
    excluded: &[EntryField],
) -> ChangeSet {
    let by_id: HashMap<&EntryId, &Entry> = incoming.iter().map(|e| (&e.id, e)).collect();
    let cached: HashMap<&EntryId, &Entry> = cached.into_iter().map(|e| (&e.id, e)).collect();

    let mut changes = ChangeSet::default();

    let mut removed_dirs = Vec::new();
    for (id, entry) in &cached {
        if scope.contains(entry) && !by_id.contains_key(id) {
            changes.removed.push((*id).clone());
            if entry.is_directory {
                removed_dirs.push(*entry);
            }
        }
    }
    changes.removed.sort();

    let mut seen = HashSet::new();
    for entry in incoming {
        if !seen.insert(&entry.id) {
            continue;
        }
        match cached.get(&entry.id) {
            None => changes.added.push(entry.clone()),
            Some(old) if entries_differ(old, entry, excluded) => changes.changed.push(entry.clone()),
            Some(_) => {}
        }
    }

    let removed: HashSet<&EntryId> = changes.removed.iter().collect();
    let mut marked: HashSet<EntryId> = changes
        .added
        .iter()
        .chain(changes.changed.iter())
        .map(|e| e.id.clone())
        .collect();
    for dir in removed_dirs {
        let Some(parent) = dir.parent_id.as_ref() else {
            continue;
        };
        if removed.contains(parent) || marked.contains(parent) {
            continue;
        }
        if let Some(parent_entry) = by_id.get(parent) {
            marked.insert(parent.clone());
            changes.changed.push((*parent_entry).clone());
        }
    }

    changes
}

// ============================================================================
// Reconciler
// ============================================================================

/// Applies diffs and server deltas to a shared [`EntryCache`]
#[derive(Debug, Clone)]
pub struct Reconciler {
    cache: Arc<EntryCache>,
}

impl Reconciler {
    pub fn new(cache: Arc<EntryCache>) -> Self {
        Self { cache }
    }

    /// The cache this reconciler writes to
    pub fn cache(&self) -> &Arc<EntryCache> {
        &self.cache
    }

    /// Diff a snapshot against the cache and apply the result atomically
    ///
    /// Returns the change set as applied: cascaded descendants are included
    /// in `removed`, hidden records are left out, and records rejected as
    /// structurally invalid do not appear.
    #[instrument(skip(self, incoming, excluded), fields(incoming = incoming.len()))]
    pub fn reconcile(
        &self,
        incoming: &[Entry],
        scope: &DiffScope,
        excluded: &[EntryField],
    ) -> ChangeSet {
        let mut state = self.cache.write();
        let delta = diff(state.all_entries(), incoming, scope, excluded);
        let applied = apply_locked(&mut state, delta, incoming, Classify::Trust);
        debug!(
            added = applied.added.len(),
            removed = applied.removed.len(),
            changed = applied.changed.len(),
            "Reconciled snapshot"
        );
        applied
    }

    /// Apply the `added`/`removed`/`changed` delta of a command response
    ///
    /// Removals run first, then additions, then changes. Records identical
    /// to the cached ones are applied silently; a reported addition the cache
    /// already held with different fields is reported as changed.
    pub fn apply_changes(&self, delta: ChangeSet) -> ChangeSet {
        let mut state = self.cache.write();
        let restore: Vec<Entry> = delta.added.iter().chain(&delta.changed).cloned().collect();
        apply_locked(&mut state, delta, &restore, Classify::Compare)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classify {
    /// Keep the delta's own classification (it came from [`diff`])
    Trust,
    /// Classify against the cache state at apply time
    Compare,
}

fn apply_locked(
    state: &mut CacheState,
    delta: ChangeSet,
    incoming: &[Entry],
    classify: Classify,
) -> ChangeSet {
    let ChangeSet {
        added,
        removed,
        changed,
    } = delta;

    let policy = state.removal_policy();
    let mut removed_all = state.remove_ids(&removed, policy);
    let cascaded: HashSet<EntryId> = removed_all.iter().cloned().collect();

    let batch = batch_parents(incoming);
    let mut applied = ChangeSet::default();
    let mut touched = HashSet::new();

    let updates = added
        .into_iter()
        .map(|e| (e, true))
        .chain(changed.into_iter().map(|e| (e, false)));
    for (entry, reported_added) in updates {
        let first_touch = touched.insert(entry.id.clone());
        let was_removed = cascaded.contains(&entry.id);
        let previous = state.lookup(&entry.id).cloned();
        let is_added = match classify {
            Classify::Trust => reported_added,
            Classify::Compare => previous.is_none() && !was_removed,
        };
        let differs = previous
            .as_ref()
            .map_or(true, |old| entries_differ(old, &entry, &[]));

        match state.upsert_one(entry, &batch) {
            Ok(Some(stored)) => {
                // A later record for the same id replaces the earlier result
                if !first_touch {
                    if let Some(slot) = applied
                        .added
                        .iter_mut()
                        .chain(applied.changed.iter_mut())
                        .find(|e| e.id == stored.id)
                    {
                        *slot = stored;
                        continue;
                    }
                }
                if is_added {
                    applied.added.push(stored);
                } else if classify == Classify::Trust || differs {
                    applied.changed.push(stored);
                }
            }
            Ok(None) => {}
            Err(err) => state.record(err),
        }
    }

    // Descendants swept by a cascade but still present in the snapshot stay
    for entry in incoming {
        if cascaded.contains(&entry.id) && !touched.contains(&entry.id) {
            touched.insert(entry.id.clone());
            if let Err(err) = state.upsert_one(entry.clone(), &batch) {
                state.record(err);
            }
        }
    }

    removed_all.retain(|id| !touched.contains(id) || state.lookup(id).is_none());
    applied.removed = removed_all;
    applied
}
