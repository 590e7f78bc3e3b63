//! Name-collision resolution port
//!
//! Before an upload or paste transfers anything, the client asks the front
//! end what to do with every name that already exists in the destination.
//! The front end answers through an [`IConflictResolver`], typically a
//! dialog; the CLI uses [`FixedResolver`].

use serde::{Deserialize, Serialize};

use crate::domain::{CommandKind, EntryId};

/// A name that already exists in the destination directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameConflict {
    /// Operation that ran into the collision (upload or paste)
    pub operation: CommandKind,
    /// Destination directory
    pub destination: EntryId,
    /// The colliding name
    pub name: String,
    /// Id of the existing entry, when known
    pub existing: Option<EntryId>,
    /// How many collisions remain after this one (including it)
    pub remaining: usize,
}

/// What to do with one colliding name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    /// Leave the existing entry alone and drop the source item
    Skip,
    /// Replace the existing entry
    Overwrite,
    /// Transfer under a new name with a numeric suffix
    Rename,
    /// Abandon the whole operation
    Cancel,
}

/// The resolver's answer for one collision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictChoice {
    pub action: ConflictAction,
    /// Apply the same action to every remaining collision
    pub apply_to_all: bool,
}

impl ConflictChoice {
    /// Choice for this collision only
    #[must_use]
    pub const fn once(action: ConflictAction) -> Self {
        Self {
            action,
            apply_to_all: false,
        }
    }

    /// Choice for this and every remaining collision
    #[must_use]
    pub const fn for_all(action: ConflictAction) -> Self {
        Self {
            action,
            apply_to_all: true,
        }
    }
}

/// Port trait for the name-collision dialogue
#[async_trait::async_trait]
pub trait IConflictResolver: Send + Sync {
    /// Asks how to handle one colliding name
    async fn resolve(&self, conflict: &NameConflict) -> ConflictChoice;
}

/// Resolver answering every collision with the same action
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub ConflictAction);

#[async_trait::async_trait]
impl IConflictResolver for FixedResolver {
    async fn resolve(&self, _conflict: &NameConflict) -> ConflictChoice {
        ConflictChoice::for_all(self.0)
    }
}
