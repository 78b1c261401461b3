//! Collaborators the replication core consumes: entity ids and metadata,
//! the [`EntityStore`] query surface, and the [`PvsEvent`] queue through
//! which the simulation, session and map layers report changes.

pub mod events;
pub mod memory;
pub mod store;
pub mod types;

pub use events::{EventSink, PvsEvent};
pub use memory::InMemoryWorld;
pub use store::EntityStore;
pub use types::*;
