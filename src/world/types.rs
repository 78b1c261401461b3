use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Simulation tick. Tick 0 means "never" / "nothing acknowledged".
pub type GameTick = u32;

/// Session identifier (one per connected client)
pub type SessionId = Uuid;

/// Visibility layers. An entity is visible to a session when every bit of
/// its mask is present in the session's mask.
pub type VisMask = u32;

/// Default layer every entity and eye starts on
pub const DEFAULT_VIS_MASK: VisMask = 1;

/// Server-side entity id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityUid(pub u32);

/// Stable network id sent to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetEntity(pub u32);

/// Entity lifecycle as far as replication cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum LifeStage {
    #[default]
    Alive,
    /// Being torn down this tick. Must not be sent anymore.
    Terminating,
    Deleted,
}

impl LifeStage {
    #[inline]
    pub fn is_terminating(self) -> bool {
        self >= LifeStage::Terminating
    }
}

/// What kind of hierarchy root an entity is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Map,
    /// A grid floating on a map. Grids are translated, never rotated.
    Grid { map: EntityUid },
}

/// Replication-relevant metadata for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMeta {
    pub net_id: NetEntity,
    pub visibility_mask: VisMask,
    pub life_stage: LifeStage,
    /// Last tick any networked component changed
    pub last_modified: GameTick,
}
