//! Sightline Server Library
//!
//! Interest management and delta replication for a tick-based
//! authoritative simulation server. Every tick, each connected session
//! receives only the entities near its viewers, as deltas against the
//! last tick it acknowledged, under a per-tick entry budget.
//!
//! # Features
//!
//! - `parallel` - Run per-session and per-chunk stages on the rayon pool (enabled by default)

pub mod config;
pub mod error;
pub mod metrics;
pub mod net;
pub mod pvs;
pub mod util;
pub mod world;

pub use config::PvsConfig;
pub use error::PvsError;
pub use pvs::system::PvsSystem;
