//! Potentially-visible-set replication.
//!
//! [`system::PvsSystem`] drives one update per tick; the other modules are
//! its stages and the data they share.

pub mod ack;
pub mod budget;
pub mod chunk;
pub mod deletion;
pub mod dirty;
pub mod history;
pub mod leave;
pub mod session;
pub mod state;
pub mod system;
pub mod visibility;
