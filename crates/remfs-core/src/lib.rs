//! remfs Core - Domain types, ports and configuration
//!
//! This crate holds everything the other remfs crates agree on:
//! - **Domain types** - `Entry`, `EntryId`, `Command`, `ChangeSet`, structural errors
//! - **Port definitions** - `ITransport` (the connector), `IConflictResolver`
//!   (the name-collision dialogue) and the `EventBus` observers subscribe to
//! - **Configuration** - YAML-backed `Config` with validation and a builder
//!
//! # Architecture
//!
//! The domain module is pure data with no I/O. Ports define the trait
//! interfaces that adapter crates (`remfs-connector`) implement and that
//! `remfs-client` drives.

pub mod config;
pub mod domain;
pub mod ports;
