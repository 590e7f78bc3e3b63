//! Mirrored filesystem entries
//!
//! An [`Entry`] is one file or directory as last reported by the connector.
//! Optional attributes are `Option`s: a later payload that omits a field
//! replaces the cached record, so the field disappears instead of going stale.
//!
//! ## Derived fields
//!
//! Some fields are computed by separate commands rather than reported with the
//! entry (currently only [`Entry::aggregate_size`]). They survive a merge when
//! the incoming record omits them and are never compared by the reconciler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::EntryId;

// ============================================================================
// Permissions
// ============================================================================

/// Read/write permissions reported for an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions {
    /// Entry content (or listing, for directories) may be read
    pub read: bool,
    /// Entry may be modified, renamed or removed; directories accept new children
    pub write: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
        }
    }
}

impl Permissions {
    /// Read-only permission set
    #[must_use]
    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }
}

// ============================================================================
// VolumeOptions
// ============================================================================

/// Per-volume policy snapshot attached to volume roots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOptions {
    /// Display path of the volume root
    pub path: Option<String>,
    /// Public URL prefix for file content, if the volume exposes one
    pub url: Option<String>,
    /// URL prefix for thumbnails
    pub tmb_url: Option<String>,
    /// Path separator used by the volume
    pub separator: Option<String>,
    /// Commands disabled on this volume (connector command names)
    pub disabled: Vec<String>,
    /// Paste replaces existing names instead of failing
    pub copy_overwrite: bool,
    /// Upload replaces existing names instead of renaming
    pub upload_overwrite: bool,
    /// Largest upload request the volume accepts, in bytes
    pub upload_max_size: Option<u64>,
}

// ============================================================================
// Entry
// ============================================================================

/// One file or directory record in the mirrored namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Stable identifier
    pub id: EntryId,
    /// Parent directory (`None` for volume roots)
    pub parent_id: Option<EntryId>,
    /// Display name
    pub name: String,
    /// Whether this entry is a directory
    pub is_directory: bool,
    /// Size in bytes (files only; `None` when unknown)
    pub size: Option<u64>,
    /// Last modification time
    pub modified: Option<DateTime<Utc>>,
    /// Read/write permissions
    pub permissions: Permissions,
    /// Entry is locked against rename/remove
    pub locked: bool,
    /// MIME type (`None` for directories)
    pub mime: Option<String>,
    /// Thumbnail reference, once generated
    pub thumbnail: Option<String>,
    /// Directory has at least one subdirectory
    pub has_subdirs: bool,
    /// Volume identifier (roots only)
    pub volume_id: Option<String>,
    /// Volume policy snapshot; present only on volume roots
    pub volume_options: Option<VolumeOptions>,
    /// Recursive size computed by the `size` command (derived)
    pub aggregate_size: Option<u64>,
}

impl Entry {
    /// Create a file entry with default permissions and no metadata
    pub fn file(id: EntryId, parent_id: EntryId, name: impl Into<String>) -> Self {
        Self {
            id,
            parent_id: Some(parent_id),
            name: name.into(),
            is_directory: false,
            size: None,
            modified: None,
            permissions: Permissions::default(),
            locked: false,
            mime: None,
            thumbnail: None,
            has_subdirs: false,
            volume_id: None,
            volume_options: None,
            aggregate_size: None,
        }
    }

    /// Create a directory entry below `parent_id`
    pub fn directory(id: EntryId, parent_id: EntryId, name: impl Into<String>) -> Self {
        Self {
            is_directory: true,
            ..Self::file(id, parent_id, name)
        }
    }

    /// Create a volume root directory
    pub fn root(id: EntryId, name: impl Into<String>, options: VolumeOptions) -> Self {
        Self {
            parent_id: None,
            volume_options: Some(options),
            ..Self::directory(id.clone(), id, name)
        }
    }

    /// Sets the size
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Sets the modification time
    #[must_use]
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Sets the MIME type
    #[must_use]
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Sets the permissions
    #[must_use]
    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// Sets the locked flag
    #[must_use]
    pub fn with_locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    /// Whether this entry is a volume root
    ///
    /// Roots are recognised by their volume options rather than by a missing
    /// parent, since some connectors give roots a synthetic parent.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.volume_options.is_some()
    }

    /// Whether `self` differs from `other` in the given field
    #[must_use]
    pub fn differs_in(&self, other: &Entry, field: EntryField) -> bool {
        match field {
            EntryField::Name => self.name != other.name,
            EntryField::Parent => self.parent_id != other.parent_id,
            EntryField::Kind => self.is_directory != other.is_directory,
            EntryField::Size => self.size != other.size,
            EntryField::Modified => self.modified != other.modified,
            EntryField::Permissions => self.permissions != other.permissions,
            EntryField::Locked => self.locked != other.locked,
            EntryField::Mime => self.mime != other.mime,
            EntryField::Thumbnail => self.thumbnail != other.thumbnail,
            EntryField::Subdirs => self.has_subdirs != other.has_subdirs,
            EntryField::Volume => self.volume_id != other.volume_id,
            EntryField::VolumeOptions => self.volume_options != other.volume_options,
            EntryField::AggregateSize => self.aggregate_size != other.aggregate_size,
        }
    }

    /// Carry derived fields over from the previously cached record
    ///
    /// Only fields the incoming record leaves empty are filled.
    pub fn inherit_derived(&mut self, previous: &Entry) {
        if self.aggregate_size.is_none() {
            self.aggregate_size = previous.aggregate_size;
        }
    }
}

// ============================================================================
// EntryField
// ============================================================================

/// Comparable fields of an [`Entry`]
///
/// Used by the reconciler to compare records field by field and by callers
/// to exclude volatile fields from comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryField {
    Name,
    Parent,
    Kind,
    Size,
    Modified,
    Permissions,
    Locked,
    Mime,
    Thumbnail,
    Subdirs,
    Volume,
    VolumeOptions,
    AggregateSize,
}

impl EntryField {
    /// Every field, in declaration order
    pub const ALL: [EntryField; 13] = [
        EntryField::Name,
        EntryField::Parent,
        EntryField::Kind,
        EntryField::Size,
        EntryField::Modified,
        EntryField::Permissions,
        EntryField::Locked,
        EntryField::Mime,
        EntryField::Thumbnail,
        EntryField::Subdirs,
        EntryField::Volume,
        EntryField::VolumeOptions,
        EntryField::AggregateSize,
    ];

    /// Fields computed locally or by separate commands
    pub const DERIVED: [EntryField; 1] = [EntryField::AggregateSize];

    /// Whether the field is derived
    #[must_use]
    pub fn is_derived(self) -> bool {
        Self::DERIVED.contains(&self)
    }
}
