//! Domain entities
//!
//! This module contains the core domain types for remfs:
//! - Newtypes for validated identifiers and tokens
//! - The mirrored `Entry` record and its field vocabulary
//! - The connector command vocabulary
//! - Change sets produced by reconciliation
//! - Domain and structural error types

pub mod change_set;
pub mod command;
pub mod entry;
pub mod errors;
pub mod newtypes;

// Re-export commonly used types
pub use change_set::{ChangeKind, ChangeSet};
pub use command::{ChunkDescriptor, Command, CommandKind, UploadFile, UploadPayload};
pub use entry::{Entry, EntryField, Permissions, VolumeOptions};
pub use errors::{DomainError, StructuralError};
pub use newtypes::*;
