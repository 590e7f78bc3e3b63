//! Change sets produced by reconciliation

use serde::{Deserialize, Serialize};

use super::entry::Entry;
use super::newtypes::EntryId;

/// How an upserted batch was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Part of an authoritative snapshot (open, tree, parents, search)
    Snapshot,
    /// Reported as newly created
    Added,
    /// Reported as modified
    Changed,
}

/// The added/removed/changed triple of one reconciliation
///
/// The three sets are disjoint: an id appears in at most one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<Entry>,
    pub removed: Vec<EntryId>,
    pub changed: Vec<Entry>,
}

impl ChangeSet {
    /// Whether nothing changed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Ids of added entries
    #[must_use]
    pub fn added_ids(&self) -> Vec<EntryId> {
        self.added.iter().map(|e| e.id.clone()).collect()
    }

    /// Ids of changed entries
    #[must_use]
    pub fn changed_ids(&self) -> Vec<EntryId> {
        self.changed.iter().map(|e| e.id.clone()).collect()
    }

    /// Total number of affected ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }
}
