use crate::net::protocol::{DecodeError, EncodeError};
use crate::world::types::{EntityUid, GameTick};

/// Errors raised by the replication core.
///
/// Only `CapacityExhausted`, `InvalidConfig` and `TimeTravel` escape
/// [`crate::PvsSystem::update`]; everything else is logged and isolated to
/// the entity or session it concerns.
#[derive(Debug, thiserror::Error)]
pub enum PvsError {
    #[error("entity capacity exhausted at {max} slots, raise entity_max")]
    CapacityExhausted { max: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("entity {0:?} was deleted while still referenced")]
    EntityDeleted(EntityUid),

    #[error("entity {0:?} has no history handle")]
    MissingHandle(EntityUid),

    #[error("tick {requested} does not follow tick {current}")]
    TimeTravel { current: GameTick, requested: GameTick },

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}
