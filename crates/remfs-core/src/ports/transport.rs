//! Transport port (driven/secondary port)
//!
//! This module defines the interface the dispatcher uses to send one logical
//! command to the remote connector. The HTTP implementation lives in
//! `remfs-connector`; tests use in-memory fakes.
//!
//! ## Design Notes
//!
//! - Errors are a typed [`TransportError`] rather than `anyhow::Error` because
//!   the dispatcher must recognise URI-too-long and timeouts.
//! - Cancellation is cooperative: the dispatcher drops the `send` future when
//!   a request is aborted, so implementations must be cancel-safe.
//! - [`NormalizedResponse`] is a port-level DTO; wire quirks (numeric
//!   booleans, `"unknown"` sizes, error arrays) are resolved by the adapter.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{Command, CompareToken, Entry, EntryId, MergeToken};

// ============================================================================
// Request
// ============================================================================

/// How the command arguments are carried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Arguments in the request URI (GET)
    #[default]
    Query,
    /// Arguments in the request body (POST)
    Body,
}

/// One logical command ready to be sent
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub command: Command,
    pub encoding: Encoding,
}

impl TransportRequest {
    /// Create a request, choosing body encoding for commands that carry bytes
    #[must_use]
    pub fn new(command: Command) -> Self {
        let encoding = match command {
            Command::Upload(_) => Encoding::Body,
            _ => Encoding::Query,
        };
        Self { command, encoding }
    }
}

// ============================================================================
// Response
// ============================================================================

/// Connector response reduced to what the client consumes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedResponse {
    /// Directory the response describes (open)
    pub cwd: Option<Entry>,
    /// Authoritative entry list (open, tree, parents, search)
    pub files: Vec<Entry>,
    /// Entries created by the command
    pub added: Vec<Entry>,
    /// Entries deleted by the command
    pub removed: Vec<EntryId>,
    /// Entries whose metadata changed
    pub changed: Vec<Entry>,
    /// Name listing (ls): name to id, when the connector reports ids
    pub listing: BTreeMap<String, Option<EntryId>>,
    /// Generated thumbnails (tmb)
    pub thumbnails: BTreeMap<EntryId, String>,
    /// Server-side fingerprint of the listing
    pub compare_token: Option<CompareToken>,
    /// The compare token sent with the request still matches
    pub unchanged: bool,
    /// Aggregate size (size)
    pub size: Option<u64>,
    /// Set when the last chunk of a file arrived and the file awaits commit
    pub merge_token: Option<MergeToken>,
    /// Original file name reported alongside the merge token
    pub merged_name: Option<String>,
    /// Largest accepted upload request in bytes (open with init)
    pub upload_max_size: Option<u64>,
    /// Connector API version (open with init)
    pub api: Option<String>,
    /// Non-fatal warnings
    pub warnings: Vec<String>,
    /// Command-level failure reasons; `None` on success
    pub error: Option<Vec<String>>,
}

impl NormalizedResponse {
    /// Whether the server reported a command failure
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.as_ref().is_some_and(|e| !e.is_empty())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Network-level failures reported by a transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established or was interrupted
    #[error("Network error: {0}")]
    Network(String),

    /// No response within the caller-supplied timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The request URI exceeded the server's length limit (HTTP 414)
    #[error("Request URI too long")]
    UriTooLong,

    /// Unexpected HTTP status
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code
        status: u16,
        /// Status text or response excerpt
        message: String,
    },

    /// The response body could not be parsed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

// ============================================================================
// ITransport trait
// ============================================================================

/// Port trait for sending commands to the remote connector
///
/// ## Implementation Notes
///
/// - One call is one logical command; retries belong to the caller.
/// - A body-level `error` field is reported through
///   [`NormalizedResponse::error`], not as a `TransportError`.
/// - Implementations must be `Send + Sync` to be shared across tasks.
#[async_trait::async_trait]
pub trait ITransport: Send + Sync {
    /// Sends one command and returns the normalized response
    ///
    /// # Arguments
    /// * `request` - The command and its argument encoding
    ///
    /// # Errors
    /// Returns a [`TransportError`] if the request could not complete
    async fn send(&self, request: &TransportRequest) -> Result<NormalizedResponse, TransportError>;
}
