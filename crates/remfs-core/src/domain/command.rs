//! Connector command vocabulary
//!
//! The remote endpoint understands a small fixed set of commands. A
//! [`Command`] carries one of them with its typed arguments; how it is encoded
//! on the wire is the transport adapter's concern.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{CompareToken, EntryId, MergeToken};

// ============================================================================
// CommandKind
// ============================================================================

/// Name of a connector command, without arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Open,
    Ls,
    Tree,
    Parents,
    Tmb,
    Size,
    Mkdir,
    Mkfile,
    Rename,
    Duplicate,
    Rm,
    Paste,
    Upload,
    Search,
    Info,
}

impl CommandKind {
    /// Every command kind
    pub const ALL: [CommandKind; 15] = [
        CommandKind::Open,
        CommandKind::Ls,
        CommandKind::Tree,
        CommandKind::Parents,
        CommandKind::Tmb,
        CommandKind::Size,
        CommandKind::Mkdir,
        CommandKind::Mkfile,
        CommandKind::Rename,
        CommandKind::Duplicate,
        CommandKind::Rm,
        CommandKind::Paste,
        CommandKind::Upload,
        CommandKind::Search,
        CommandKind::Info,
    ];

    /// Wire name of the command
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            CommandKind::Open => "open",
            CommandKind::Ls => "ls",
            CommandKind::Tree => "tree",
            CommandKind::Parents => "parents",
            CommandKind::Tmb => "tmb",
            CommandKind::Size => "size",
            CommandKind::Mkdir => "mkdir",
            CommandKind::Mkfile => "mkfile",
            CommandKind::Rename => "rename",
            CommandKind::Duplicate => "duplicate",
            CommandKind::Rm => "rm",
            CommandKind::Paste => "paste",
            CommandKind::Upload => "upload",
            CommandKind::Search => "search",
            CommandKind::Info => "info",
        }
    }

    /// Directory-open is the only navigation command
    #[must_use]
    pub const fn is_navigation(self) -> bool {
        matches!(self, CommandKind::Open)
    }

    /// Commands that are only meaningful for the directory that was current
    /// when they were issued, and are dropped when the user navigates away
    #[must_use]
    pub const fn is_cwd_bound_by_default(self) -> bool {
        matches!(self, CommandKind::Tmb | CommandKind::Parents)
    }

    /// Commands that change remote state
    #[must_use]
    pub const fn is_mutating(self) -> bool {
        matches!(
            self,
            CommandKind::Mkdir
                | CommandKind::Mkfile
                | CommandKind::Rename
                | CommandKind::Duplicate
                | CommandKind::Rm
                | CommandKind::Paste
                | CommandKind::Upload
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DomainError::ValidationFailed(format!("Unknown command: {s}")))
    }
}

// ============================================================================
// Upload payloads
// ============================================================================

/// One file (or one chunk of a file) carried by an upload request
#[derive(Clone, PartialEq, Eq)]
pub struct UploadFile {
    /// Target file name in the destination directory
    pub name: String,
    /// Bytes to send
    pub data: Vec<u8>,
    /// MIME type, if known
    pub mime: Option<String>,
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .field("mime", &self.mime)
            .finish()
    }
}

/// Position of one chunk inside a chunked upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Random identifier shared by all chunks of one file
    pub cid: String,
    /// Zero-based chunk index
    pub index: usize,
    /// Number of chunks for the file
    pub total: usize,
    /// Byte offset of the chunk in the file
    pub offset: u64,
    /// Chunk length in bytes
    pub length: u64,
    /// Size of the whole file
    pub file_size: u64,
}

impl ChunkDescriptor {
    /// Chunk name the server uses to collect parts: `name.{index}_{last}.part`
    #[must_use]
    pub fn part_name(&self, file_name: &str) -> String {
        format!(
            "{file_name}.{}_{}.part",
            self.index,
            self.total.saturating_sub(1)
        )
    }

    /// The `range` parameter: `offset,length,file_size`
    #[must_use]
    pub fn range_param(&self) -> String {
        format!("{},{},{}", self.offset, self.length, self.file_size)
    }
}

/// Arguments of an `upload` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPayload {
    /// One or more whole files in a single request
    Files {
        target: EntryId,
        files: Vec<UploadFile>,
        overwrite: bool,
    },
    /// One chunk of a large file
    Chunk {
        target: EntryId,
        file: UploadFile,
        chunk: ChunkDescriptor,
        overwrite: bool,
    },
    /// Commit of a fully transferred chunked file
    Merge {
        target: EntryId,
        token: MergeToken,
        name: String,
        overwrite: bool,
    },
}

impl UploadPayload {
    /// Destination directory
    #[must_use]
    pub fn target(&self) -> &EntryId {
        match self {
            UploadPayload::Files { target, .. }
            | UploadPayload::Chunk { target, .. }
            | UploadPayload::Merge { target, .. } => target,
        }
    }

    /// Number of payload bytes carried by the request
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        match self {
            UploadPayload::Files { files, .. } => files.iter().map(|f| f.data.len() as u64).sum(),
            UploadPayload::Chunk { file, .. } => file.data.len() as u64,
            UploadPayload::Merge { .. } => 0,
        }
    }
}

// ============================================================================
// Command
// ============================================================================

/// A connector command with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a directory (the default volume when `target` is `None`)
    Open {
        target: Option<EntryId>,
        /// Initial request: the server also reports API version and limits
        init: bool,
        /// Include the directory tree of every volume
        tree: bool,
        /// Local fingerprint of the directory listing
        compare: Option<CompareToken>,
    },
    /// Names inside a directory, optionally restricted to `intersect`
    Ls {
        target: EntryId,
        intersect: Vec<String>,
    },
    /// Subdirectories of a directory
    Tree { target: EntryId },
    /// Ancestor chain of a directory, with siblings
    Parents { target: EntryId },
    /// Generate thumbnails
    Tmb { targets: Vec<EntryId> },
    /// Recursive size of entries
    Size { targets: Vec<EntryId> },
    Mkdir {
        target: EntryId,
        name: String,
    },
    Mkfile {
        target: EntryId,
        name: String,
    },
    Rename {
        target: EntryId,
        name: String,
    },
    Duplicate { targets: Vec<EntryId> },
    Rm { targets: Vec<EntryId> },
    /// Copy or move entries into `dst`
    Paste {
        dst: EntryId,
        targets: Vec<EntryId>,
        cut: bool,
        /// Names in `dst` to back up under `suffix` before pasting
        renames: Vec<String>,
        suffix: Option<String>,
    },
    Upload(UploadPayload),
    Search {
        query: String,
        target: Option<EntryId>,
    },
    /// Fresh metadata for entries
    Info { targets: Vec<EntryId> },
}

impl Command {
    /// Kind of the command
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Open { .. } => CommandKind::Open,
            Command::Ls { .. } => CommandKind::Ls,
            Command::Tree { .. } => CommandKind::Tree,
            Command::Parents { .. } => CommandKind::Parents,
            Command::Tmb { .. } => CommandKind::Tmb,
            Command::Size { .. } => CommandKind::Size,
            Command::Mkdir { .. } => CommandKind::Mkdir,
            Command::Mkfile { .. } => CommandKind::Mkfile,
            Command::Rename { .. } => CommandKind::Rename,
            Command::Duplicate { .. } => CommandKind::Duplicate,
            Command::Rm { .. } => CommandKind::Rm,
            Command::Paste { .. } => CommandKind::Paste,
            Command::Upload(_) => CommandKind::Upload,
            Command::Search { .. } => CommandKind::Search,
            Command::Info { .. } => CommandKind::Info,
        }
    }

    /// Whether this is a navigation command
    #[must_use]
    pub fn is_navigation(&self) -> bool {
        self.kind().is_navigation()
    }
}
