use crate::net::protocol::EntityState;
use crate::util::vec2::{Box2, Vec2};
use crate::world::types::{EntityMeta, EntityUid, GameTick, RootKind, SessionId, VisMask};

/// Read-only view of the entity hierarchy.
///
/// Queried from rayon workers during a tick, hence `Sync`. Positions are
/// translation-only: a grid's local frame is its map's frame shifted by
/// the grid origin.
pub trait EntityStore: Sync {
    /// Metadata for a live (or terminating) entity
    fn meta(&self, uid: EntityUid) -> Option<EntityMeta>;

    fn parent(&self, uid: EntityUid) -> Option<EntityUid>;

    fn children(&self, uid: EntityUid) -> &[EntityUid];

    /// `Some` when the entity is a map or a grid
    fn root_kind(&self, uid: EntityUid) -> Option<RootKind>;

    /// Position relative to the parent
    fn local_position(&self, uid: EntityUid) -> Option<Vec2>;

    fn world_position(&self, uid: EntityUid) -> Option<Vec2>;

    /// Topmost ancestor (the map) of an entity
    fn map_of(&self, uid: EntityUid) -> Option<EntityUid>;

    /// Grids on `map` whose bounds touch `area` (world space)
    fn grids_intersecting(&self, map: EntityUid, area: Box2, out: &mut Vec<EntityUid>);

    /// Visibility mask of a viewer's eye. `None` when the entity has no eye.
    fn eye_mask(&self, uid: EntityUid) -> Option<VisMask>;

    /// Component diff since `from_tick`. `send_all` ignores modification
    /// ticks and includes every networked component.
    fn entity_state(
        &self,
        uid: EntityUid,
        from_tick: GameTick,
        session: SessionId,
        send_all: bool,
    ) -> Option<EntityState>;

    fn for_each_entity(&self, f: &mut dyn FnMut(EntityUid));

    #[inline]
    fn is_root(&self, uid: EntityUid) -> bool {
        self.root_kind(uid).is_some()
    }

    #[inline]
    fn is_alive(&self, uid: EntityUid) -> bool {
        self.meta(uid).is_some_and(|m| !m.life_stage.is_terminating())
    }
}
