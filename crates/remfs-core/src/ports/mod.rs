//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the boundaries between the client core and its collaborators.
//!
//! ## Ports Overview
//!
//! - [`ITransport`] - Sends one command to the remote connector
//! - [`IConflictResolver`] - Asks the front end how to handle name collisions
//! - [`EventBus`] - Broadcasts [`ClientEvent`]s to observers

pub mod conflict;
pub mod events;
pub mod transport;

pub use conflict::{ConflictAction, ConflictChoice, FixedResolver, IConflictResolver, NameConflict};
pub use events::{ClientEvent, EventBus, DEFAULT_EVENT_CAPACITY};
pub use transport::{Encoding, ITransport, NormalizedResponse, TransportError, TransportRequest};
