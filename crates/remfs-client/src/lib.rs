//! remfs Client - Request dispatching, uploads and synchronization
//!
//! Provides:
//! - Bounded concurrent request dispatch with navigation priority
//! - Chunked multi-connection uploads with conflict pre-flight
//! - Compare-token short-circuited directory synchronization
//! - A command facade front ends drive
//!
//! ## Modules
//!
//! - [`dispatcher`] - Request lanes, queueing, cancellation and 414 retry
//! - [`notify`] - Delayed "working" notifications per command kind
//! - [`conflict`] - Name-collision resolution and unique naming
//! - [`upload`] - Upload planning, chunking and commit
//! - [`engine`] - Sync cycles against the entry cache
//! - [`scheduler`] - Periodic and on-demand sync triggering
//! - [`session`] - The [`Browser`] command facade

pub mod conflict;
pub mod dispatcher;
pub mod engine;
pub mod notify;
pub mod scheduler;
pub mod session;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::{AbortMode, Dispatcher, Lane, RequestHandle, RequestId, RequestOptions, RequestState};
pub use engine::{SyncEngine, SyncOutcome, SyncScope};
pub use notify::NotifyPolicy;
pub use scheduler::{SyncScheduler, SyncTrigger};
pub use session::{Browser, Operation};
pub use upload::{FolderItem, UploadPipeline, UploadReport};

use remfs_core::domain::{CommandKind, DomainError, EntryId};
use remfs_core::ports::TransportError;
use thiserror::Error;

/// Errors a dispatched request can settle with
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The request was aborted before it settled
    #[error("Request aborted")]
    Aborted {
        /// Quiet aborts are not reported to the user
        quiet: bool,
    },

    /// The transport failed (after the URI-too-long retry, if any)
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The connector executed the command and reported failure
    #[error("Connector error: {}", .0.join(" "))]
    Remote(Vec<String>),

    /// A navigation is in flight and the policy rejects overlapping ones
    #[error("A navigation request is already in progress")]
    NavigationInProgress,

    /// The dispatcher went away before the request settled
    #[error("Dispatcher closed")]
    Closed,
}

impl DispatchError {
    /// Whether this is an abort the user should not hear about
    pub fn is_quiet_abort(&self) -> bool {
        matches!(self, DispatchError::Aborted { quiet: true })
    }
}

/// Name collisions that could not be settled before a transfer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// Collisions exist and no resolver is configured
    #[error("Unresolved name conflicts: {}", .0.join(", "))]
    Unresolved(Vec<String>),

    /// The resolver cancelled the whole operation
    #[error("Operation cancelled during conflict resolution")]
    Cancelled,
}

/// Invocation exceeds a configured size limit
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapacityError {
    /// More items than one call may carry
    #[error("Too many items: {requested} requested, limit is {limit}")]
    TooManyItems {
        limit: usize,
        requested: usize,
        /// Suggested split: item counts of consecutive calls
        suggested: Vec<usize>,
    },
}

/// Errors returned by the command facade
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// The capability map disables the command for the target
    #[error("Command {command} is disabled for {target}")]
    CommandDisabled { command: CommandKind, target: EntryId },

    /// The command needs a working directory and none is open yet
    #[error("No working directory; call init first")]
    NoWorkingDirectory,

    /// The connector answered without the fields the command needs
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        ClientError::Dispatch(DispatchError::Transport(err))
    }
}

impl ClientError {
    /// Whether the failure came from the network rather than the connector
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Dispatch(DispatchError::Transport(_)))
    }

    /// Whether this is a quiet abort
    pub fn is_quiet_abort(&self) -> bool {
        matches!(self, ClientError::Dispatch(e) if e.is_quiet_abort())
    }
}
