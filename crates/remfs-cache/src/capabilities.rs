//! Command capability map
//!
//! Resolves, once per directory context, which commands are disabled for the
//! working directory and each of its children. Front ends and the command
//! facade ask a single question: [`CapabilityMap::is_command_enabled`].
//!
//! ## Rules
//!
//! - Commands named in the volume root's `disabled` list are off everywhere
//!   in that volume.
//! - A locked entry cannot be removed, renamed or cut.
//! - An entry without write permission accepts no mkdir, mkfile, upload,
//!   paste, rename or rm.
//! - An entry without read permission cannot be opened, listed or walked.

use std::collections::{HashMap, HashSet};

use remfs_core::domain::{CommandKind, Entry, EntryId};
use tracing::trace;

use crate::store::EntryCache;

/// Volume `disabled` token for moving entries out of a directory
const CUT: &str = "cut";

const LOCKED_DENIES: [CommandKind; 2] = [CommandKind::Rm, CommandKind::Rename];

const READ_ONLY_DENIES: [CommandKind; 6] = [
    CommandKind::Mkdir,
    CommandKind::Mkfile,
    CommandKind::Upload,
    CommandKind::Paste,
    CommandKind::Rename,
    CommandKind::Rm,
];

const UNREADABLE_DENIES: [CommandKind; 3] = [CommandKind::Open, CommandKind::Ls, CommandKind::Tree];

/// Disabled commands for one entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Denied {
    commands: HashSet<CommandKind>,
    cut: bool,
}

/// Resolved `id -> disabled commands` table for one directory context
#[derive(Debug, Clone, Default)]
pub struct CapabilityMap {
    cwd: Option<EntryId>,
    volume: Denied,
    entries: HashMap<EntryId, Denied>,
}

impl CapabilityMap {
    /// Resolve capabilities for `cwd` and its cached children
    ///
    /// An uncached `cwd` yields a map where only unknown-id fallbacks apply,
    /// i.e. everything is enabled.
    pub fn resolve(cache: &EntryCache, cwd: &EntryId) -> Self {
        let volume = cache
            .root_of(cwd)
            .and_then(|root| root.volume_options)
            .map(|options| volume_denied(&options.disabled))
            .unwrap_or_default();

        let mut entries = HashMap::new();
        if let Some(dir) = cache.get(cwd) {
            entries.insert(dir.id.clone(), entry_denied(&dir, &volume));
        }
        for child in cache.children_of(cwd) {
            entries.insert(child.id.clone(), entry_denied(&child, &volume));
        }

        trace!(cwd = %cwd, entries = entries.len(), "Resolved capability map");
        Self {
            cwd: Some(cwd.clone()),
            volume,
            entries,
        }
    }

    /// Directory the map was resolved for
    pub fn cwd(&self) -> Option<&EntryId> {
        self.cwd.as_ref()
    }

    /// Whether `command` may be issued against `id`
    ///
    /// Ids outside the resolved context fall back to the volume-level rules.
    pub fn is_command_enabled(&self, command: CommandKind, id: &EntryId) -> bool {
        !self.denied(id).commands.contains(&command)
    }

    /// Whether `id` may be moved out of its directory
    pub fn is_cut_enabled(&self, id: &EntryId) -> bool {
        !self.denied(id).cut
    }

    /// Commands disabled for `id`, sorted
    pub fn disabled_for(&self, id: &EntryId) -> Vec<CommandKind> {
        let mut commands: Vec<_> = self.denied(id).commands.iter().copied().collect();
        commands.sort();
        commands
    }

    fn denied(&self, id: &EntryId) -> &Denied {
        self.entries.get(id).unwrap_or(&self.volume)
    }
}

fn volume_denied(disabled: &[String]) -> Denied {
    let mut denied = Denied::default();
    for name in disabled {
        if name == CUT {
            denied.cut = true;
        } else if let Ok(kind) = name.parse::<CommandKind>() {
            denied.commands.insert(kind);
        }
    }
    denied
}

fn entry_denied(entry: &Entry, volume: &Denied) -> Denied {
    let mut denied = volume.clone();
    if entry.locked {
        denied.commands.extend(LOCKED_DENIES);
        denied.cut = true;
    }
    if !entry.permissions.write {
        denied.commands.extend(READ_ONLY_DENIES);
    }
    if !entry.permissions.read {
        denied.commands.extend(UNREADABLE_DENIES);
    }
    denied
}
