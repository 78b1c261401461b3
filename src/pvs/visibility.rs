//! Which chunks and overrides a session can see.

use std::cell::RefCell;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, error};

use crate::config::CHUNK_SIZE;
use crate::error::PvsError;
use crate::pvs::chunk::{ChunkEntry, ChunkIndex, ChunkLocation};
use crate::pvs::history::PvsHandle;
use crate::pvs::session::PvsSession;
use crate::util::vec2::{Box2, Vec2};
use crate::world::store::EntityStore;
use crate::world::types::{EntityUid, SessionId, VisMask, DEFAULT_VIS_MASK};

thread_local! {
    /// Grid query scratch, reused by every viewer processed on this worker
    static GRID_BUFFER: RefCell<Vec<EntityUid>> = RefCell::new(Vec::with_capacity(16));
}

// ============================================================================
// Viewers & chunks
// ============================================================================

/// A point a session sees from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewer {
    pub uid: EntityUid,
    pub map: EntityUid,
    pub position: Vec2,
    pub range: f32,
}

/// A chunk in view, with its distance to the nearest viewer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleChunk {
    pub location: ChunkLocation,
    /// Chebyshev distance in chunks, drives level of detail
    pub chebyshev: f32,
    /// Squared world distance, drives send priority
    pub distance_sq: f32,
}

/// Collect the session's viewers: attached entity first, then view
/// subscriptions. Also recomputes the session's visibility mask.
pub fn gather_viewers(session: &mut PvsSession, store: &dyn EntityStore, range: f32) {
    session.viewers.clear();
    let mut mask: VisMask = 0;

    let candidates = session
        .attached
        .into_iter()
        .chain(session.view_subscriptions.iter().copied().filter(|v| Some(*v) != session.attached));

    for uid in candidates {
        let (Some(position), Some(map)) = (store.world_position(uid), store.map_of(uid)) else {
            debug!("Skipping viewer {:?} of session {}: not in the world", uid, session.id);
            continue;
        };
        mask |= store.eye_mask(uid).unwrap_or(DEFAULT_VIS_MASK);
        session.viewers.push(Viewer {
            uid,
            map,
            position,
            range,
        });
    }

    session.visibility_mask = if mask == 0 { DEFAULT_VIS_MASK } else { mask };
}

fn push_cells(index: &ChunkIndex, root: EntityUid, area: Box2, out: &mut Vec<ChunkLocation>) {
    let ((x0, y0), (x1, y1)) = area.cell_range(CHUNK_SIZE);
    for x in x0..=x1 {
        for y in y0..=y1 {
            let location = ChunkLocation::new(root, (x, y));
            if index.get(&location).is_some() {
                out.push(location);
            }
        }
    }
}

/// Every existing chunk overlapped by a viewer's view box, on its map and
/// on any grid the box touches
pub fn viewer_chunks(viewer: &Viewer, store: &dyn EntityStore, index: &ChunkIndex, out: &mut Vec<ChunkLocation>) {
    let area = Box2::centered(viewer.position, viewer.range);
    push_cells(index, viewer.map, area, out);

    GRID_BUFFER.with(|buffer| {
        let mut grids = buffer.borrow_mut();
        grids.clear();
        store.grids_intersecting(viewer.map, area, &mut grids);
        for &grid in grids.iter() {
            let Some(origin) = store.world_position(grid) else {
                continue;
            };
            push_cells(index, grid, area.translated(-origin), out);
        }
    });
}

/// Stage 2a: viewers and the unordered set of overlapped chunks
pub fn gather_visible_chunks(session: &mut PvsSession, store: &dyn EntityStore, index: &ChunkIndex, range: f32) {
    gather_viewers(session, store, range);

    let mut locations = std::mem::take(&mut session.chunk_locations);
    locations.clear();
    for viewer in &session.viewers {
        viewer_chunks(viewer, store, index, &mut locations);
    }
    locations.sort_unstable();
    locations.dedup();
    session.chunk_locations = locations;
}

/// Stage 2b: distances against refreshed chunk positions, nearest first.
/// Chunks still dirty after the rebuild (population failed) are skipped.
pub fn rank_chunks(session: &mut PvsSession, index: &ChunkIndex) {
    session.chunks.clear();
    for location in &session.chunk_locations {
        let Some(chunk) = index.get(location) else {
            continue;
        };
        if chunk.is_dirty() {
            continue;
        }

        let mut best: Option<VisibleChunk> = None;
        for viewer in session.viewers.iter().filter(|v| v.map == chunk.map) {
            let delta = chunk.position - viewer.position;
            let chebyshev = delta.max_abs() / CHUNK_SIZE;
            let distance_sq = delta.length_sq();
            best = Some(match best {
                Some(b) => VisibleChunk {
                    location: *location,
                    chebyshev: b.chebyshev.min(chebyshev),
                    distance_sq: b.distance_sq.min(distance_sq),
                },
                None => VisibleChunk {
                    location: *location,
                    chebyshev,
                    distance_sq,
                },
            });
        }
        if let Some(visible) = best {
            session.chunks.push(visible);
        }
    }
    session
        .chunks
        .sort_by(|a, b| a.distance_sq.total_cmp(&b.distance_sq));
}

// ============================================================================
// Overrides
// ============================================================================

/// Append `uid` and its ancestors (root first) to `out`, then all of its
/// descendants when `recursive`. Entries already in `out` keep their order.
pub fn resolve_override(
    uid: EntityUid,
    recursive: bool,
    store: &dyn EntityStore,
    handles: &FxHashMap<EntityUid, PvsHandle>,
    out: &mut Vec<ChunkEntry>,
) -> Result<(), PvsError> {
    let mut chain: SmallVec<[EntityUid; 8]> = SmallVec::new();
    let mut current = Some(uid);
    while let Some(u) = current {
        chain.push(u);
        current = store.parent(u);
    }

    let start = out.len();
    let mut parent: Option<PvsHandle> = None;
    for &u in chain.iter().rev() {
        if store.meta(u).is_none() {
            out.truncate(start);
            return Err(PvsError::EntityDeleted(u));
        }
        let Some(&handle) = handles.get(&u) else {
            out.truncate(start);
            return Err(PvsError::MissingHandle(u));
        };
        out.push(ChunkEntry { uid: u, handle, parent });
        parent = Some(handle);
    }

    if recursive {
        let mut i = out.len() - 1;
        while i < out.len() {
            let entry = out[i];
            for &child in store.children(entry.uid) {
                let Some(&handle) = handles.get(&child) else {
                    out.truncate(start);
                    return Err(PvsError::MissingHandle(child));
                };
                out.push(ChunkEntry {
                    uid: child,
                    handle,
                    parent: Some(entry.handle),
                });
            }
            i += 1;
        }
    }
    Ok(())
}

/// Entities sent regardless of range.
///
/// Global and session overrides still respect the visibility mask; forced
/// entities ignore both mask and budget. Overrides of either kind are not
/// held back by the budget but still count against it.
#[derive(Debug, Default)]
pub struct OverrideRegistry {
    /// uid -> recursive
    global: FxHashMap<EntityUid, bool>,
    forced: FxHashSet<EntityUid>,
    session: FxHashMap<SessionId, FxHashSet<EntityUid>>,
    session_forced: FxHashMap<SessionId, FxHashSet<EntityUid>>,

    cached_global: Vec<ChunkEntry>,
    cached_forced: Vec<ChunkEntry>,
}

impl OverrideRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_global(&mut self, uid: EntityUid, recursive: bool) {
        self.global.insert(uid, recursive);
    }

    pub fn remove_global(&mut self, uid: EntityUid) {
        self.global.remove(&uid);
    }

    pub fn add_forced(&mut self, session: Option<SessionId>, uid: EntityUid) {
        match session {
            Some(s) => {
                self.session_forced.entry(s).or_default().insert(uid);
            }
            None => {
                self.forced.insert(uid);
            }
        }
    }

    pub fn remove_forced(&mut self, session: Option<SessionId>, uid: EntityUid) {
        match session {
            Some(s) => {
                if let Some(set) = self.session_forced.get_mut(&s) {
                    set.remove(&uid);
                }
            }
            None => {
                self.forced.remove(&uid);
            }
        }
    }

    pub fn add_session(&mut self, session: SessionId, uid: EntityUid) {
        self.session.entry(session).or_default().insert(uid);
    }

    pub fn remove_session(&mut self, session: SessionId, uid: EntityUid) {
        if let Some(set) = self.session.get_mut(&session) {
            set.remove(&uid);
        }
    }

    /// Forget a deleted entity everywhere
    pub fn remove_entity(&mut self, uid: EntityUid) {
        self.global.remove(&uid);
        self.forced.remove(&uid);
        for set in self.session.values_mut() {
            set.remove(&uid);
        }
        for set in self.session_forced.values_mut() {
            set.remove(&uid);
        }
    }

    /// Drop all overrides of a disconnected session
    pub fn remove_session_all(&mut self, session: SessionId) {
        self.session.remove(&session);
        self.session_forced.remove(&session);
    }

    pub fn clear(&mut self) {
        self.global.clear();
        self.forced.clear();
        self.session.clear();
        self.session_forced.clear();
        self.cached_global.clear();
        self.cached_forced.clear();
    }

    pub fn is_forced(&self, uid: EntityUid) -> bool {
        self.forced.contains(&uid)
    }

    /// Resolve the global lists once per tick so sessions can share them
    pub fn cache_globals(&mut self, store: &dyn EntityStore, handles: &FxHashMap<EntityUid, PvsHandle>) {
        self.cached_forced.clear();
        self.cached_global.clear();

        let mut forced: Vec<EntityUid> = self.forced.iter().copied().collect();
        forced.sort_unstable();
        for uid in forced {
            if let Err(e) = resolve_override(uid, false, store, handles, &mut self.cached_forced) {
                error!("Failed to resolve forced entity {:?}: {}", uid, e);
            }
        }

        let mut global: Vec<(EntityUid, bool)> = self.global.iter().map(|(u, r)| (*u, *r)).collect();
        global.sort_unstable();
        for (uid, recursive) in global {
            if let Err(e) = resolve_override(uid, recursive, store, handles, &mut self.cached_global) {
                error!("Failed to resolve global override {:?}: {}", uid, e);
            }
        }
    }

    #[inline]
    pub fn cached_forced(&self) -> &[ChunkEntry] {
        &self.cached_forced
    }

    #[inline]
    pub fn cached_global(&self) -> &[ChunkEntry] {
        &self.cached_global
    }

    /// Session-specific overrides, sorted for a stable walk order
    pub fn session_overrides(&self, session: SessionId) -> SmallVec<[EntityUid; 8]> {
        let mut out: SmallVec<[EntityUid; 8]> = self
            .session
            .get(&session)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    pub fn session_forced(&self, session: SessionId) -> SmallVec<[EntityUid; 8]> {
        let mut out: SmallVec<[EntityUid; 8]> = self
            .session_forced
            .get(&session)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pvs::history::EntityArena;
    use crate::world::memory::InMemoryWorld;
    use uuid::Uuid;

    fn handles_for(world: &InMemoryWorld) -> FxHashMap<EntityUid, PvsHandle> {
        let mut arena = EntityArena::new(64, 64, 1024, 1);
        world
            .entity_ids()
            .into_iter()
            .map(|uid| (uid, arena.allocate(uid, &world.meta(uid).unwrap()).unwrap()))
            .collect()
    }

    fn index_with(world: &InMemoryWorld, entries: &[(EntityUid, EntityUid, EntityUid)]) -> ChunkIndex {
        let mut index = ChunkIndex::new();
        for &(uid, root, map) in entries {
            let local = world.local_position(uid).unwrap();
            index.add_entity(uid, ChunkLocation::containing(root, local), map);
        }
        index
    }

    #[test]
    fn test_viewers_attached_first_no_duplicates() {
        let mut world = InMemoryWorld::new();
        let map = world.spawn_map();
        let body = world.spawn(map, Vec2::new(1.0, 1.0));
        let camera = world.spawn(map, Vec2::new(50.0, 0.0));
        world.set_eye(body, 0b01);
        world.set_eye(camera, 0b10);

        let mut session = PvsSession::new(Uuid::new_v4(), "a".into(), 8, 20);
        session.attached = Some(body);
        session.view_subscriptions.push(camera);
        session.view_subscriptions.push(body);

        gather_viewers(&mut session, &world, 12.5);
        let uids: Vec<_> = session.viewers.iter().map(|v| v.uid).collect();
        assert_eq!(uids, vec![body, camera]);
        assert_eq!(session.visibility_mask, 0b11);
        assert_eq!(session.viewers[1].position, Vec2::new(50.0, 0.0));
    }

    #[test]
    fn test_no_viewers_default_mask() {
        let world = InMemoryWorld::new();
        let mut session = PvsSession::new(Uuid::new_v4(), "a".into(), 8, 20);
        gather_viewers(&mut session, &world, 12.5);
        assert!(session.viewers.is_empty());
        assert_eq!(session.visibility_mask, DEFAULT_VIS_MASK);
    }

    #[test]
    fn test_visible_chunks_in_range_only() {
        let mut world = InMemoryWorld::new();
        let map = world.spawn_map();
        let body = world.spawn(map, Vec2::new(4.0, 4.0));
        let near = world.spawn(map, Vec2::new(14.0, 4.0));
        let far = world.spawn(map, Vec2::new(100.0, 100.0));
        let index = index_with(&world, &[(body, map, map), (near, map, map), (far, map, map)]);

        let mut session = PvsSession::new(Uuid::new_v4(), "a".into(), 8, 20);
        session.attached = Some(body);
        gather_visible_chunks(&mut session, &world, &index, 12.5);

        assert_eq!(
            session.chunk_locations,
            vec![ChunkLocation::new(map, (0, 0)), ChunkLocation::new(map, (1, 0))]
        );
    }

    #[test]
    fn test_grid_chunks_found_in_local_frame() {
        let mut world = InMemoryWorld::new();
        let map = world.spawn_map();
        let grid = world.spawn_grid(map, Vec2::new(20.0, 0.0), Vec2::new(32.0, 32.0));
        let body = world.spawn(map, Vec2::new(16.0, 4.0));
        let cargo = world.spawn(grid, Vec2::new(2.0, 2.0));
        let index = index_with(&world, &[(body, map, map), (cargo, grid, map)]);

        let mut session = PvsSession::new(Uuid::new_v4(), "a".into(), 8, 20);
        session.attached = Some(body);
        gather_visible_chunks(&mut session, &world, &index, 12.5);

        assert!(session.chunk_locations.contains(&ChunkLocation::new(grid, (0, 0))));
    }

    #[test]
    fn test_rank_chunks_nearest_first() {
        let mut world = InMemoryWorld::new();
        let map = world.spawn_map();
        let body = world.spawn(map, Vec2::new(20.0, 4.0));
        let a = world.spawn(map, Vec2::new(4.0, 4.0));
        let handles = handles_for(&world);
        let mut index = index_with(&world, &[(body, map, map), (a, map, map)]);

        let mut session = PvsSession::new(Uuid::new_v4(), "a".into(), 8, 20);
        session.attached = Some(body);
        gather_visible_chunks(&mut session, &world, &index, 12.5);
        for loc in &session.chunk_locations {
            index.queue_update(loc);
        }
        index.refresh_queued(&world, &handles);
        rank_chunks(&mut session, &index);

        assert_eq!(session.chunks.len(), 2);
        assert_eq!(session.chunks[0].location, ChunkLocation::new(map, (2, 0)));
        assert_eq!(session.chunks[1].location, ChunkLocation::new(map, (0, 0)));
        // (4,4) is 16 units from (20,4): two chunks away
        assert_eq!(session.chunks[1].chebyshev, 2.0);
        assert_eq!(session.chunks[1].distance_sq, 256.0);
    }

    #[test]
    fn test_rank_skips_dirty_chunks() {
        let mut world = InMemoryWorld::new();
        let map = world.spawn_map();
        let body = world.spawn(map, Vec2::new(4.0, 4.0));
        let index = index_with(&world, &[(body, map, map)]);

        let mut session = PvsSession::new(Uuid::new_v4(), "a".into(), 8, 20);
        session.attached = Some(body);
        gather_visible_chunks(&mut session, &world, &index, 12.5);
        rank_chunks(&mut session, &index);
        assert!(session.chunks.is_empty());
    }

    #[test]
    fn test_resolve_override_ancestors_then_descendants() {
        let mut world = InMemoryWorld::new();
        let map = world.spawn_map();
        let a = world.spawn(map, Vec2::ZERO);
        let b = world.spawn(a, Vec2::ZERO);
        let c = world.spawn(b, Vec2::ZERO);
        let handles = handles_for(&world);

        let mut out = Vec::new();
        resolve_override(b, false, &world, &handles, &mut out).unwrap();
        let uids: Vec<_> = out.iter().map(|e| e.uid).collect();
        assert_eq!(uids, vec![map, a, b]);
        assert_eq!(out[0].parent, None);
        assert_eq!(out[2].parent, Some(handles[&a]));

        out.clear();
        resolve_override(a, true, &world, &handles, &mut out).unwrap();
        let uids: Vec<_> = out.iter().map(|e| e.uid).collect();
        assert_eq!(uids, vec![map, a, b, c]);
    }

    #[test]
    fn test_resolve_override_deleted() {
        let mut world = InMemoryWorld::new();
        let map = world.spawn_map();
        let a = world.spawn(map, Vec2::ZERO);
        let handles = handles_for(&world);
        world.delete(a);

        let mut out = Vec::new();
        assert!(matches!(
            resolve_override(a, false, &world, &handles, &mut out),
            Err(PvsError::EntityDeleted(_))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_registry_cache_and_removal() {
        let mut world = InMemoryWorld::new();
        let map = world.spawn_map();
        let a = world.spawn(map, Vec2::ZERO);
        let handles = handles_for(&world);

        let mut registry = OverrideRegistry::new();
        registry.add_forced(None, map);
        registry.add_global(a, false);
        let session = Uuid::new_v4();
        registry.add_session(session, a);
        registry.cache_globals(&world, &handles);

        assert_eq!(registry.cached_forced().len(), 1);
        assert_eq!(registry.cached_global().len(), 2);
        assert_eq!(registry.session_overrides(session).as_slice(), &[a]);

        registry.remove_entity(a);
        registry.cache_globals(&world, &handles);
        assert!(registry.cached_global().is_empty());
        assert!(registry.session_overrides(session).is_empty());
        assert!(registry.is_forced(map));
    }
}
