//! Reference [`EntityStore`] backed by hash maps.
//!
//! Drives the server binary, tests and benchmarks. Every mutation reports
//! the matching [`PvsEvent`] to the attached sink, the same way a real
//! simulation would.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::net::protocol::{ComponentChange, EntityState};
use crate::util::vec2::{Box2, Vec2};
use crate::world::events::{EventSink, PvsEvent};
use crate::world::store::EntityStore;
use crate::world::types::{
    EntityMeta, EntityUid, GameTick, LifeStage, NetEntity, RootKind, SessionId, VisMask,
    DEFAULT_VIS_MASK,
};

/// Component id carrying the entity's local position
pub const TRANSFORM_COMPONENT: u16 = 0;

#[derive(Debug, Clone)]
struct Component {
    data: Vec<u8>,
    last_modified: GameTick,
}

#[derive(Debug, Clone)]
struct WorldEntity {
    net_id: NetEntity,
    parent: Option<EntityUid>,
    children: Vec<EntityUid>,
    local: Vec2,
    root: Option<RootKind>,
    /// Grid extent in local space
    bounds: Box2,
    mask: VisMask,
    eye_mask: Option<VisMask>,
    life_stage: LifeStage,
    last_modified: GameTick,
    components: BTreeMap<u16, Component>,
    removed: Vec<(u16, GameTick)>,
}

#[derive(Debug)]
pub struct InMemoryWorld {
    entities: FxHashMap<EntityUid, WorldEntity>,
    next_uid: u32,
    next_net: u32,
    tick: GameTick,
    sink: Option<EventSink>,
}

impl Default for InMemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_position(p: Vec2) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&p.x.to_le_bytes());
    out.extend_from_slice(&p.y.to_le_bytes());
    out
}

impl InMemoryWorld {
    pub fn new() -> Self {
        Self {
            entities: FxHashMap::default(),
            next_uid: 1,
            next_net: 1,
            tick: 1,
            sink: None,
        }
    }

    pub fn with_sink(sink: EventSink) -> Self {
        let mut world = Self::new();
        world.sink = Some(sink);
        world
    }

    #[inline]
    fn emit(&self, event: PvsEvent) {
        if let Some(sink) = &self.sink {
            sink.send(event);
        }
    }

    /// Current simulation tick; new modifications are stamped with it
    pub fn tick(&self) -> GameTick {
        self.tick
    }

    pub fn set_tick(&mut self, tick: GameTick) {
        self.tick = tick;
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entity_ids(&self) -> Vec<EntityUid> {
        let mut ids: Vec<_> = self.entities.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn net_id(&self, uid: EntityUid) -> Option<NetEntity> {
        self.entities.get(&uid).map(|e| e.net_id)
    }

    fn insert(&mut self, parent: Option<EntityUid>, local: Vec2, root: Option<RootKind>) -> EntityUid {
        let uid = EntityUid(self.next_uid);
        self.next_uid += 1;
        let net_id = NetEntity(self.next_net);
        self.next_net += 1;

        let mut components = BTreeMap::new();
        components.insert(
            TRANSFORM_COMPONENT,
            Component {
                data: encode_position(local),
                last_modified: self.tick,
            },
        );

        self.entities.insert(
            uid,
            WorldEntity {
                net_id,
                parent,
                children: Vec::new(),
                local,
                root,
                bounds: Box2::default(),
                mask: DEFAULT_VIS_MASK,
                eye_mask: None,
                life_stage: LifeStage::Alive,
                last_modified: self.tick,
                components,
                removed: Vec::new(),
            },
        );
        if let Some(p) = parent.and_then(|p| self.entities.get_mut(&p)) {
            p.children.push(uid);
        }
        uid
    }

    /// Create a new map (a hierarchy root with no parent)
    pub fn spawn_map(&mut self) -> EntityUid {
        let uid = self.insert(None, Vec2::ZERO, Some(RootKind::Map));
        self.emit(PvsEvent::EntityAdded { uid });
        self.emit(PvsEvent::RootAdded { uid });
        uid
    }

    /// Create a grid on `map` with its origin at `origin` and the given local extent
    pub fn spawn_grid(&mut self, map: EntityUid, origin: Vec2, size: Vec2) -> EntityUid {
        let uid = self.insert(Some(map), origin, Some(RootKind::Grid { map }));
        if let Some(grid) = self.entities.get_mut(&uid) {
            grid.bounds = Box2::new(Vec2::ZERO, size);
        }
        self.emit(PvsEvent::EntityAdded { uid });
        self.emit(PvsEvent::RootAdded { uid });
        uid
    }

    /// Create a plain entity under `parent` at a parent-relative position
    pub fn spawn(&mut self, parent: EntityUid, local: Vec2) -> EntityUid {
        let uid = self.insert(Some(parent), local, None);
        self.emit(PvsEvent::EntityAdded { uid });
        uid
    }

    /// Give an entity an eye so it can act as a viewer
    pub fn set_eye(&mut self, uid: EntityUid, mask: VisMask) {
        if let Some(e) = self.entities.get_mut(&uid) {
            e.eye_mask = Some(mask);
        }
    }

    fn touch(&mut self, uid: EntityUid) {
        let tick = self.tick;
        if let Some(e) = self.entities.get_mut(&uid) {
            e.last_modified = tick;
        }
        self.emit(PvsEvent::EntityDirty { uid, tick });
    }

    pub fn set_position(&mut self, uid: EntityUid, local: Vec2) {
        let tick = self.tick;
        let Some(e) = self.entities.get_mut(&uid) else {
            return;
        };
        e.local = local;
        e.components.insert(
            TRANSFORM_COMPONENT,
            Component {
                data: encode_position(local),
                last_modified: tick,
            },
        );
        self.touch(uid);
        self.emit(PvsEvent::EntityMoved { uid, old_parent: None });
    }

    pub fn reparent(&mut self, uid: EntityUid, new_parent: EntityUid, local: Vec2) {
        if !self.entities.contains_key(&new_parent) {
            return;
        }
        let Some(old_parent) = self.entities.get(&uid).and_then(|e| e.parent) else {
            return;
        };
        if let Some(p) = self.entities.get_mut(&old_parent) {
            p.children.retain(|c| *c != uid);
        }
        if let Some(p) = self.entities.get_mut(&new_parent) {
            p.children.push(uid);
        }
        let tick = self.tick;
        if let Some(e) = self.entities.get_mut(&uid) {
            e.parent = Some(new_parent);
            e.local = local;
            e.components.insert(
                TRANSFORM_COMPONENT,
                Component {
                    data: encode_position(local),
                    last_modified: tick,
                },
            );
        }
        self.touch(uid);
        self.emit(PvsEvent::EntityMoved {
            uid,
            old_parent: Some(old_parent),
        });
    }

    pub fn set_component(&mut self, uid: EntityUid, id: u16, data: Vec<u8>) {
        let tick = self.tick;
        let Some(e) = self.entities.get_mut(&uid) else {
            return;
        };
        e.components.insert(
            id,
            Component {
                data,
                last_modified: tick,
            },
        );
        e.removed.retain(|(r, _)| *r != id);
        self.touch(uid);
    }

    pub fn remove_component(&mut self, uid: EntityUid, id: u16) {
        let tick = self.tick;
        let Some(e) = self.entities.get_mut(&uid) else {
            return;
        };
        if e.components.remove(&id).is_some() {
            e.removed.push((id, tick));
            self.touch(uid);
        }
    }

    pub fn set_visibility_mask(&mut self, uid: EntityUid, mask: VisMask) {
        if let Some(e) = self.entities.get_mut(&uid) {
            e.mask = mask;
            self.emit(PvsEvent::VisibilityChanged { uid, mask });
        }
    }

    /// Flag an entity as being torn down without removing it yet
    pub fn terminate(&mut self, uid: EntityUid) {
        if let Some(e) = self.entities.get_mut(&uid) {
            e.life_stage = LifeStage::Terminating;
            self.emit(PvsEvent::EntityTerminating { uid });
        }
    }

    /// Delete an entity and its whole subtree, children first
    pub fn delete(&mut self, uid: EntityUid) {
        let Some(entity) = self.entities.get_mut(&uid) else {
            return;
        };
        entity.life_stage = LifeStage::Terminating;
        let children = std::mem::take(&mut entity.children);
        let is_root = entity.root.is_some();
        self.emit(PvsEvent::EntityTerminating { uid });
        if is_root {
            self.emit(PvsEvent::RootRemoved { uid });
        }

        for child in children {
            self.delete(child);
        }

        let parent = self.entities.remove(&uid).and_then(|e| e.parent);
        if let Some(p) = parent.and_then(|p| self.entities.get_mut(&p)) {
            p.children.retain(|c| *c != uid);
        }
        self.emit(PvsEvent::EntityDeleted { uid, parent });
    }
}

impl EntityStore for InMemoryWorld {
    fn meta(&self, uid: EntityUid) -> Option<EntityMeta> {
        self.entities.get(&uid).map(|e| EntityMeta {
            net_id: e.net_id,
            visibility_mask: e.mask,
            life_stage: e.life_stage,
            last_modified: e.last_modified,
        })
    }

    fn parent(&self, uid: EntityUid) -> Option<EntityUid> {
        self.entities.get(&uid).and_then(|e| e.parent)
    }

    fn children(&self, uid: EntityUid) -> &[EntityUid] {
        self.entities
            .get(&uid)
            .map(|e| e.children.as_slice())
            .unwrap_or(&[])
    }

    fn root_kind(&self, uid: EntityUid) -> Option<RootKind> {
        self.entities.get(&uid).and_then(|e| e.root)
    }

    fn local_position(&self, uid: EntityUid) -> Option<Vec2> {
        self.entities.get(&uid).map(|e| e.local)
    }

    fn world_position(&self, uid: EntityUid) -> Option<Vec2> {
        let mut entity = self.entities.get(&uid)?;
        if entity.parent.is_none() {
            return Some(Vec2::ZERO);
        }
        let mut pos = entity.local;
        while let Some(parent) = entity.parent.and_then(|p| self.entities.get(&p)) {
            if parent.parent.is_none() {
                break;
            }
            pos += parent.local;
            entity = parent;
        }
        Some(pos)
    }

    fn map_of(&self, uid: EntityUid) -> Option<EntityUid> {
        let mut current = uid;
        let mut entity = self.entities.get(&current)?;
        while let Some(parent) = entity.parent {
            current = parent;
            entity = self.entities.get(&current)?;
        }
        Some(current)
    }

    fn grids_intersecting(&self, map: EntityUid, area: Box2, out: &mut Vec<EntityUid>) {
        for &child in self.children(map) {
            let Some(e) = self.entities.get(&child) else {
                continue;
            };
            if matches!(e.root, Some(RootKind::Grid { .. })) && e.bounds.translated(e.local).intersects(&area) {
                out.push(child);
            }
        }
    }

    fn eye_mask(&self, uid: EntityUid) -> Option<VisMask> {
        self.entities.get(&uid).and_then(|e| e.eye_mask)
    }

    fn entity_state(
        &self,
        uid: EntityUid,
        from_tick: GameTick,
        _session: SessionId,
        send_all: bool,
    ) -> Option<EntityState> {
        let e = self.entities.get(&uid)?;
        let changes = e
            .components
            .iter()
            .filter(|(_, c)| send_all || c.last_modified > from_tick)
            .map(|(id, c)| ComponentChange {
                component_id: *id,
                state: Some(c.data.clone()),
                last_modified: c.last_modified,
            })
            .collect();

        let removed_since = from_tick > 0 && e.removed.iter().any(|(_, t)| *t > from_tick);
        Some(EntityState {
            net_id: e.net_id,
            changes,
            last_modified: e.last_modified,
            present_components: removed_since.then(|| e.components.keys().copied().collect()),
        })
    }

    fn for_each_entity(&self, f: &mut dyn FnMut(EntityUid)) {
        for uid in self.entities.keys() {
            f(*uid);
        }
    }
}
