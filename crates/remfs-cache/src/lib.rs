//! remfs Cache - In-memory mirror of the remote namespace
//!
//! Holds every entry the connector has reported and keeps it consistent
//! with server snapshots:
//! - Entry records indexed by id, by parent and in a hidden side store
//! - Snapshot reconciliation into minimal add/remove/change sets
//! - Per-directory command capability resolution
//!
//! ## Architecture
//!
//! The cache is a plain owned component shared as `Arc<EntryCache>`. It has
//! no I/O of its own: `remfs-client` feeds it with connector responses and
//! front ends read from it. All mutations of one batch happen under a single
//! write lock.
//!
//! ## Key Components
//!
//! - [`EntryCache`] - Indexed entry store with structural checks
//! - [`Reconciler`] / [`diff`] - Snapshot reconciliation
//! - [`CapabilityMap`] - Which commands are enabled where
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use remfs_cache::{DiffScope, EntryCache, Reconciler};
//! use remfs_core::domain::{Entry, EntryId, VolumeOptions};
//!
//! let cache = Arc::new(EntryCache::new());
//! let reconciler = Reconciler::new(Arc::clone(&cache));
//!
//! let root = EntryId::new("v1_Lw").unwrap();
//! let snapshot = vec![Entry::root(root.clone(), "Home", VolumeOptions::default())];
//! let changes = reconciler.reconcile(&snapshot, &DiffScope::All, &[]);
//! assert_eq!(changes.added.len(), 1);
//! ```

pub mod capabilities;
pub mod reconcile;
pub mod store;

pub use capabilities::CapabilityMap;
pub use reconcile::{diff, entries_differ, Reconciler};
pub use store::{DiffScope, EntryCache, HidePolicy, RemovePolicy};
