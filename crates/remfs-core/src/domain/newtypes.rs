//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the identifiers and tokens exchanged with the
//! connector. Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// EntryId
// ============================================================================

/// Stable identifier of a mirrored entry
///
/// The connector calls this the entry "hash": an opaque string that is unique
/// within the whole mirrored namespace (volume prefix plus encoded path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId(String);

impl EntryId {
    /// Create a new EntryId
    ///
    /// # Errors
    /// Returns error if the ID is empty or contains whitespace or control characters
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DomainError::InvalidEntryId(
                "Entry ID cannot be empty".to_string(),
            ));
        }

        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(DomainError::InvalidEntryId(format!(
                "Entry ID contains invalid characters: {id:?}"
            )));
        }

        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EntryId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.0
    }
}

impl AsRef<str> for EntryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// CompareToken
// ============================================================================

/// Cheap fingerprint of a directory listing
///
/// Made of the number of cached children and the newest modification time
/// among them. Sent with a sync request so the server can answer "unchanged"
/// instead of a full snapshot.
///
/// Wire format: `"{count}_{max_modified_unix}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompareToken {
    count: usize,
    max_modified: i64,
}

impl CompareToken {
    /// Build a token from a child count and the newest modification time
    #[must_use]
    pub fn new(count: usize, max_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            count,
            max_modified: max_modified.map(|t| t.timestamp()).unwrap_or(0),
        }
    }

    /// Number of children covered by the token
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Newest child modification time as a unix timestamp (0 when unknown)
    #[must_use]
    pub const fn max_modified(&self) -> i64 {
        self.max_modified
    }

    /// Encode for the `compare` request parameter
    #[must_use]
    pub fn to_wire(&self) -> String {
        format!("{}_{}", self.count, self.max_modified)
    }
}

impl Display for CompareToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

impl FromStr for CompareToken {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, max_modified) = s
            .split_once('_')
            .ok_or_else(|| DomainError::InvalidToken(format!("Malformed compare token: {s}")))?;

        let count = count
            .parse::<usize>()
            .map_err(|e| DomainError::InvalidToken(format!("Invalid count in {s}: {e}")))?;
        let max_modified = max_modified
            .parse::<i64>()
            .map_err(|e| DomainError::InvalidToken(format!("Invalid timestamp in {s}: {e}")))?;

        Ok(Self {
            count,
            max_modified,
        })
    }
}

// ============================================================================
// MergeToken
// ============================================================================

/// Token the server returns once every chunk of a file has arrived
///
/// The upload pipeline echoes it in a final commit request; only that
/// request makes the file visible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MergeToken(String);

impl MergeToken {
    /// Create a new MergeToken
    ///
    /// # Errors
    /// Returns error if the token is empty
    pub fn new(token: impl Into<String>) -> Result<Self, DomainError> {
        let token = token.into();
        if token.is_empty() {
            return Err(DomainError::InvalidToken(
                "Merge token cannot be empty".to_string(),
            ));
        }
        Ok(Self(token))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MergeToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for MergeToken {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<MergeToken> for String {
    fn from(token: MergeToken) -> Self {
        token.0
    }
}
