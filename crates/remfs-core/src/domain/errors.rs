//! Domain error types
//!
//! Validation failures for identifiers and names, and the structural errors
//! raised when incoming tree data would corrupt the cache.

use thiserror::Error;

use super::newtypes::EntryId;

/// Errors that can occur while constructing domain values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Entry identifier is empty or malformed
    #[error("Invalid entry ID: {0}")]
    InvalidEntryId(String),

    /// Entry name is empty or contains a path separator
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Compare or merge token could not be parsed
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Malformed or cyclic tree data rejected at ingestion
///
/// A structural error never reaches the caller of a command: the offending
/// entry is dropped and the error is recorded on the cache for inspection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StructuralError {
    /// The entry names itself as its parent
    #[error("Entry {id} is its own parent")]
    SelfParent {
        /// The rejected entry
        id: EntryId,
    },

    /// Following the parent chain from the entry leads back to it
    #[error("Entry {id} would form a cycle through parent {parent}")]
    Cycle {
        /// The rejected entry
        id: EntryId,
        /// The parent it declared
        parent: EntryId,
    },
}

impl StructuralError {
    /// The id of the entry that was rejected
    pub fn entry_id(&self) -> &EntryId {
        match self {
            StructuralError::SelfParent { id } | StructuralError::Cycle { id, .. } => id,
        }
    }
}
