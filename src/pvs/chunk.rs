//! Spatial chunk index.
//!
//! Entities parented directly to a map or grid are bucketed into
//! `CHUNK_SIZE`-sided cells of that root. Everything deeper in the
//! hierarchy rides along with its root-level ancestor. Each chunk keeps a
//! lazily rebuilt, breadth-first content list so a session can walk it
//! parent-before-child.

use std::sync::atomic::{AtomicUsize, Ordering};

use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
use tracing::error;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::config::CHUNK_SIZE;
use crate::error::PvsError;
use crate::pvs::history::PvsHandle;
use crate::util::vec2::Vec2;
use crate::world::store::EntityStore;
use crate::world::types::EntityUid;

/// Integer cell coordinates inside a root's local frame
pub type ChunkIndices = (i32, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkLocation {
    pub root: EntityUid,
    pub indices: ChunkIndices,
}

impl ChunkLocation {
    #[inline]
    pub fn new(root: EntityUid, indices: ChunkIndices) -> Self {
        Self { root, indices }
    }

    /// Cell containing a root-local position
    #[inline]
    pub fn containing(root: EntityUid, local: Vec2) -> Self {
        Self {
            root,
            indices: local.floor_div(CHUNK_SIZE),
        }
    }

    /// Cell centre in the root's local frame
    #[inline]
    pub fn local_centre(&self) -> Vec2 {
        Vec2::new(
            (self.indices.0 as f32 + 0.5) * CHUNK_SIZE,
            (self.indices.1 as f32 + 0.5) * CHUNK_SIZE,
        )
    }
}

/// One entity in a chunk's content list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    pub uid: EntityUid,
    pub handle: PvsHandle,
    /// `None` only for the map itself
    pub parent: Option<PvsHandle>,
}

#[derive(Debug)]
pub struct PvsChunk {
    pub location: ChunkLocation,
    pub map: EntityUid,
    /// Entities parented directly to the root inside this cell
    children: FxHashSet<EntityUid>,
    /// `[map, grid?, children.., descendants..]`
    contents: Vec<ChunkEntry>,
    /// Length of the prefix up to and including the direct children
    low_lod_count: usize,
    dirty: bool,
    /// Cell centre in world space
    pub position: Vec2,
    update_queued: bool,
}

impl PvsChunk {
    fn new(location: ChunkLocation, map: EntityUid) -> Self {
        Self {
            location,
            map,
            children: FxHashSet::default(),
            contents: Vec::new(),
            low_lod_count: 0,
            dirty: true,
            position: location.local_centre(),
            update_queued: false,
        }
    }

    fn reinit(&mut self, location: ChunkLocation, map: EntityUid) {
        self.location = location;
        self.map = map;
        self.children.clear();
        self.contents.clear();
        self.low_lod_count = 0;
        self.dirty = true;
        self.position = location.local_centre();
        self.update_queued = false;
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Idempotent; drops the cached contents
    #[inline]
    pub fn mark_dirty(&mut self) {
        if !self.dirty {
            self.dirty = true;
            self.contents.clear();
            self.low_lod_count = 0;
        }
    }

    pub fn contains_child(&self, uid: EntityUid) -> bool {
        self.children.contains(&uid)
    }

    /// Full content list, `None` while dirty
    #[inline]
    pub fn contents(&self) -> Option<&[ChunkEntry]> {
        (!self.dirty).then_some(self.contents.as_slice())
    }

    /// Root plus direct children only, for distant chunks
    #[inline]
    pub fn low_lod_contents(&self) -> Option<&[ChunkEntry]> {
        (!self.dirty).then(|| &self.contents[..self.low_lod_count])
    }

    /// Rebuild the topologically sorted content list.
    ///
    /// On failure the chunk stays dirty and is retried next time it is seen.
    pub fn populate(
        &mut self,
        store: &dyn EntityStore,
        handles: &FxHashMap<EntityUid, PvsHandle>,
    ) -> Result<(), PvsError> {
        self.contents.clear();
        self.low_lod_count = 0;

        let result = self.collect(store, handles);
        if result.is_err() {
            self.contents.clear();
            self.dirty = true;
        } else {
            self.dirty = false;
        }
        result
    }

    fn push(
        &mut self,
        store: &dyn EntityStore,
        handles: &FxHashMap<EntityUid, PvsHandle>,
        uid: EntityUid,
        parent: Option<PvsHandle>,
    ) -> Result<PvsHandle, PvsError> {
        if store.meta(uid).is_none() {
            return Err(PvsError::EntityDeleted(uid));
        }
        let handle = *handles.get(&uid).ok_or(PvsError::MissingHandle(uid))?;
        self.contents.push(ChunkEntry { uid, handle, parent });
        Ok(handle)
    }

    fn collect(
        &mut self,
        store: &dyn EntityStore,
        handles: &FxHashMap<EntityUid, PvsHandle>,
    ) -> Result<(), PvsError> {
        let map = self.push(store, handles, self.map, None)?;
        let root = if self.location.root == self.map {
            map
        } else {
            self.push(store, handles, self.location.root, Some(map))?
        };

        let mut children: Vec<EntityUid> = self.children.iter().copied().collect();
        children.sort_unstable();
        let first_child = self.contents.len();
        for child in children {
            self.push(store, handles, child, Some(root))?;
        }
        self.low_lod_count = self.contents.len();

        let mut i = first_child;
        while i < self.contents.len() {
            let parent = self.contents[i];
            for &child in store.children(parent.uid) {
                self.push(store, handles, child, Some(parent.handle))?;
            }
            i += 1;
        }
        Ok(())
    }

    /// Rebuild if dirty and refresh the world position. Returns whether contents were rebuilt.
    fn refresh(
        &mut self,
        store: &dyn EntityStore,
        handles: &FxHashMap<EntityUid, PvsHandle>,
    ) -> Result<bool, PvsError> {
        self.update_queued = false;
        match store.world_position(self.location.root) {
            Some(origin) if store.is_alive(self.location.root) => {
                self.position = origin + self.location.local_centre();
            }
            _ => {
                error!(
                    "Encountered deleted root {:?} while updating chunk position",
                    self.location.root
                );
            }
        }
        if !self.dirty {
            return Ok(false);
        }
        self.populate(store, handles).map(|_| true)
    }
}

pub type ChunkMap = hashbrown::HashMap<ChunkLocation, PvsChunk, FxBuildHasher>;

/// All chunks, plus reverse lookups from entity and root to chunk
#[derive(Debug, Default)]
pub struct ChunkIndex {
    chunks: ChunkMap,
    entity_chunks: FxHashMap<EntityUid, ChunkLocation>,
    root_chunks: FxHashMap<EntityUid, FxHashSet<ChunkLocation>>,
    pool: Vec<PvsChunk>,
}

/// Result of a chunk refresh pass
#[derive(Debug, Default)]
pub struct RefreshStats {
    pub rebuilt: usize,
    pub failed: Vec<ChunkLocation>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[inline]
    pub fn get(&self, location: &ChunkLocation) -> Option<&PvsChunk> {
        self.chunks.get(location)
    }

    #[inline]
    pub fn location_of(&self, uid: EntityUid) -> Option<ChunkLocation> {
        self.entity_chunks.get(&uid).copied()
    }

    /// Insert `uid` as a direct child of the chunk at `location`, creating it if needed
    pub fn add_entity(&mut self, uid: EntityUid, location: ChunkLocation, map: EntityUid) {
        match self.entity_chunks.get(&uid) {
            Some(current) if *current == location => return,
            Some(_) => {
                self.remove_entity(uid);
            }
            None => {}
        }

        let pool = &mut self.pool;
        let chunk = self.chunks.entry(location).or_insert_with(|| match pool.pop() {
            Some(mut chunk) => {
                chunk.reinit(location, map);
                chunk
            }
            None => PvsChunk::new(location, map),
        });
        chunk.children.insert(uid);
        chunk.mark_dirty();

        self.entity_chunks.insert(uid, location);
        self.root_chunks.entry(location.root).or_default().insert(location);
    }

    /// Take `uid` out of its chunk. Empty chunks are removed.
    pub fn remove_entity(&mut self, uid: EntityUid) -> Option<ChunkLocation> {
        let location = self.entity_chunks.remove(&uid)?;
        let Some(chunk) = self.chunks.get_mut(&location) else {
            return Some(location);
        };
        chunk.children.remove(&uid);
        chunk.mark_dirty();

        if chunk.children.is_empty() {
            if let Some(chunk) = self.chunks.remove(&location) {
                self.pool.push(chunk);
            }
            if let Some(set) = self.root_chunks.get_mut(&location.root) {
                set.remove(&location);
                if set.is_empty() {
                    self.root_chunks.remove(&location.root);
                }
            }
        }
        Some(location)
    }

    pub fn mark_dirty(&mut self, location: &ChunkLocation) {
        if let Some(chunk) = self.chunks.get_mut(location) {
            chunk.mark_dirty();
        }
    }

    pub fn mark_entity_chunk_dirty(&mut self, uid: EntityUid) -> bool {
        match self.entity_chunks.get(&uid).copied() {
            Some(location) => {
                self.mark_dirty(&location);
                true
            }
            None => false,
        }
    }

    /// Drop every chunk belonging to a destroyed map or grid
    pub fn remove_root(&mut self, root: EntityUid) -> usize {
        let Some(locations) = self.root_chunks.remove(&root) else {
            return 0;
        };
        let count = locations.len();
        for location in locations {
            if let Some(chunk) = self.chunks.remove(&location) {
                for child in &chunk.children {
                    self.entity_chunks.remove(child);
                }
                self.pool.push(chunk);
            }
        }
        count
    }

    /// Flag a chunk as needed this tick. Returns false if it doesn't exist.
    #[inline]
    pub fn queue_update(&mut self, location: &ChunkLocation) -> bool {
        match self.chunks.get_mut(location) {
            Some(chunk) => {
                chunk.update_queued = true;
                true
            }
            None => false,
        }
    }

    /// Rebuild every queued dirty chunk and refresh queued chunk positions,
    /// in parallel across chunks.
    pub fn refresh_queued(
        &mut self,
        store: &dyn EntityStore,
        handles: &FxHashMap<EntityUid, PvsHandle>,
    ) -> RefreshStats {
        let rebuilt = AtomicUsize::new(0);
        let refresh = |chunk: &mut PvsChunk| -> Option<ChunkLocation> {
            if !chunk.update_queued {
                return None;
            }
            match chunk.refresh(store, handles) {
                Ok(true) => {
                    rebuilt.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Ok(false) => None,
                Err(e) => {
                    error!("Failed to populate chunk {:?}: {}", chunk.location, e);
                    Some(chunk.location)
                }
            }
        };

        #[cfg(feature = "parallel")]
        let failed: Vec<ChunkLocation> = self.chunks.par_values_mut().filter_map(refresh).collect();
        #[cfg(not(feature = "parallel"))]
        let failed: Vec<ChunkLocation> = self.chunks.values_mut().filter_map(refresh).collect();

        RefreshStats {
            rebuilt: rebuilt.into_inner(),
            failed,
        }
    }

    pub fn clear(&mut self) {
        for (_, chunk) in self.chunks.drain() {
            self.pool.push(chunk);
        }
        self.entity_chunks.clear();
        self.root_chunks.clear();
    }
}
