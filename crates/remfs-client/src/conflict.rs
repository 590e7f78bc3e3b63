//! Name-collision handling for uploads and pastes
//!
//! Collisions are settled before any byte moves: the caller queries the
//! destination for the incoming names, then [`resolve_collisions`] walks the
//! colliding ones through the front end's [`IConflictResolver`].

use std::collections::{HashMap, HashSet};

use remfs_core::domain::{CommandKind, EntryId};
use remfs_core::ports::{ConflictAction, IConflictResolver, NameConflict};
use tracing::{debug, info};

use crate::ConflictError;

/// Separator between a base name and its counter
const COUNTER_SEPARATOR: char = '-';

/// Candidates tried before falling back to a random suffix
const MAX_COUNTER: u32 = 10_000;

/// Multi-part extensions kept intact when renaming
const COMPOUND_EXTENSIONS: &[&str] = &[
    "tar.gz", "tar.bz", "tar.bz2", "tar.z", "tar.lzo", "cpio.gz", "ps.gz", "xcf.gz", "xcf.bz2",
];

/// Splits `name` into stem and extension (with its leading dot)
fn split_extension(name: &str) -> (&str, &str) {
    let lower = name.to_ascii_lowercase();
    for ext in COMPOUND_EXTENSIONS {
        let dotted_len = ext.len() + 1;
        if lower.len() > dotted_len
            && lower.ends_with(ext)
            && lower.as_bytes()[lower.len() - dotted_len] == b'.'
        {
            return name.split_at(name.len() - dotted_len);
        }
    }

    match name.rfind('.') {
        Some(dot) => {
            let ext = &name[dot + 1..];
            if (1..=4).contains(&ext.len()) && ext.bytes().all(|b| b.is_ascii_alphanumeric()) {
                name.split_at(dot)
            } else {
                (name, "")
            }
        }
        None => (name, ""),
    }
}

/// Returns a name not in `existing`, in the `name-N.ext` form
///
/// The result always differs from `name`: a stem already ending in `-N`
/// continues counting from `N + 1`; otherwise counting starts at 1.
/// Multi-part extensions such as `.tar.gz` are kept.
///
/// # Examples
///
/// ```
/// use std::collections::HashSet;
/// use remfs_client::conflict::unique_name;
///
/// let existing: HashSet<String> = ["a.txt".into(), "a-1.txt".into()].into();
/// assert_eq!(unique_name("a.txt", &existing), "a-2.txt");
/// ```
pub fn unique_name(name: &str, existing: &HashSet<String>) -> String {
    let (stem, ext) = split_extension(name);

    let (base, start) = match stem.rfind(COUNTER_SEPARATOR) {
        Some(pos) => {
            let digits = &stem[pos + 1..];
            match digits.parse::<u32>() {
                Ok(n) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
                    (&stem[..pos], n.saturating_add(1))
                }
                _ => (stem, 1),
            }
        }
        None => (stem, 1),
    };

    for i in start..=MAX_COUNTER {
        let candidate = format!("{base}{COUNTER_SEPARATOR}{i}{ext}");
        if !existing.contains(&candidate) {
            return candidate;
        }
    }

    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{base}{COUNTER_SEPARATOR}{}{ext}", &random[..8])
}

/// Asks the resolver about every collision, honouring "apply to all"
///
/// # Arguments
/// * `resolver` - Front-end dialogue; `None` means collisions are fatal
/// * `operation` - `Upload` or `Paste`
/// * `destination` - Directory the items go to
/// * `collisions` - Colliding names with the id of the existing entry, if known
///
/// # Errors
/// - [`ConflictError::Unresolved`] if there are collisions and no resolver
/// - [`ConflictError::Cancelled`] if the resolver cancels
pub async fn resolve_collisions(
    resolver: Option<&dyn IConflictResolver>,
    operation: CommandKind,
    destination: &EntryId,
    collisions: Vec<(String, Option<EntryId>)>,
) -> Result<HashMap<String, ConflictAction>, ConflictError> {
    let mut decisions = HashMap::with_capacity(collisions.len());
    if collisions.is_empty() {
        return Ok(decisions);
    }

    let Some(resolver) = resolver else {
        let names = collisions.into_iter().map(|(name, _)| name).collect();
        return Err(ConflictError::Unresolved(names));
    };

    let total = collisions.len();
    let mut sticky: Option<ConflictAction> = None;
    for (index, (name, existing)) in collisions.into_iter().enumerate() {
        let action = match sticky {
            Some(action) => action,
            None => {
                let conflict = NameConflict {
                    operation,
                    destination: destination.clone(),
                    name: name.clone(),
                    existing,
                    remaining: total - index,
                };
                let choice = resolver.resolve(&conflict).await;
                if choice.apply_to_all {
                    sticky = Some(choice.action);
                }
                choice.action
            }
        };

        if action == ConflictAction::Cancel {
            info!(%operation, %destination, "Conflict resolution cancelled");
            return Err(ConflictError::Cancelled);
        }
        debug!(%name, ?action, "Collision resolved");
        decisions.insert(name, action);
    }

    Ok(decisions)
}
