//! Per-entity history arena.
//!
//! Every tracked entity owns one slot, addressed by a [`PvsHandle`]. Each
//! session keeps a `Vec<SessionEntry>` of the same length, indexed by the
//! same handle, so per-(entity, session) bookkeeping is a plain index.
//!
//! Deleted handles are not reused right away: acks for states that still
//! reference them may arrive for up to `force_ack_threshold` ticks. A
//! released handle moves `incoming -> pending -> free`, one step every
//! `force_ack_threshold + 1` ticks, and its session entries are cleared on
//! the last step.

use bitvec::prelude::*;
use tracing::{debug, error};

use crate::error::PvsError;
use crate::world::types::{EntityMeta, EntityUid, GameTick, LifeStage, NetEntity, VisMask};

/// Index into the arena plus the slot generation it was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PvsHandle {
    index: u32,
    generation: u32,
}

impl PvsHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Process-wide metadata for one entity, duplicated from the store so the
/// hot per-session walk never leaves the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRecord {
    pub uid: EntityUid,
    pub net_id: NetEntity,
    pub last_modified: GameTick,
    pub visibility_mask: VisMask,
    pub life_stage: LifeStage,
}

impl EntityRecord {
    const EMPTY: EntityRecord = EntityRecord {
        uid: EntityUid(0),
        net_id: NetEntity(0),
        last_modified: 0,
        visibility_mask: 0,
        life_stage: LifeStage::Deleted,
    };
}

/// What one session knows about one entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionEntry {
    /// Last tick the entity was included in this session's state
    pub last_sent: GameTick,
    /// Last tick the entity was reported as leaving view
    pub last_left_view: GameTick,
    /// Last tick whose state containing this entity was acknowledged
    pub last_acked: GameTick,
}

#[derive(Debug)]
pub struct EntityArena {
    records: Vec<EntityRecord>,
    generations: Vec<u32>,
    live: BitVec,
    free: Vec<u32>,
    incoming: Vec<PvsHandle>,
    pending: Vec<PvsHandle>,
    last_rotation: GameTick,
    return_delay: GameTick,
    initial: usize,
    growth: usize,
    max: usize,
}

impl EntityArena {
    pub fn new(initial: usize, growth: usize, max: usize, return_delay: GameTick) -> Self {
        let mut arena = Self {
            records: Vec::new(),
            generations: Vec::new(),
            live: BitVec::new(),
            free: Vec::new(),
            incoming: Vec::new(),
            pending: Vec::new(),
            last_rotation: 0,
            return_delay: return_delay.max(1),
            initial: initial.max(1).min(max),
            growth,
            max,
        };
        arena.resize(arena.initial);
        arena
    }

    fn resize(&mut self, capacity: usize) {
        let old = self.records.len();
        self.records.resize(capacity, EntityRecord::EMPTY);
        self.generations.resize(capacity, 0);
        self.live.resize(capacity, false);
        // Popped from the back, so lower indices are handed out first
        self.free.extend((old..capacity).rev().map(|i| i as u32));
    }

    /// Slot count. Session data vectors must have exactly this length.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    pub fn live_count(&self) -> usize {
        self.live.count_ones()
    }

    fn grow(&mut self) -> Result<(), PvsError> {
        let capacity = self.capacity();
        let target = if self.growth == 0 {
            capacity.saturating_mul(2)
        } else {
            capacity.saturating_add(self.growth)
        }
        .min(self.max);

        if target <= capacity {
            error!(
                "PVS entity arena exhausted at {} entities; raise entity_max",
                capacity
            );
            return Err(PvsError::CapacityExhausted { max: self.max });
        }

        debug!("Growing PVS entity arena {} -> {}", capacity, target);
        self.resize(target);
        Ok(())
    }

    /// Assign a slot to a new entity, growing the arena if needed
    pub fn allocate(&mut self, uid: EntityUid, meta: &EntityMeta) -> Result<PvsHandle, PvsError> {
        if self.free.is_empty() {
            self.grow()?;
        }
        let Some(index) = self.free.pop() else {
            return Err(PvsError::CapacityExhausted { max: self.max });
        };

        let i = index as usize;
        self.records[i] = EntityRecord {
            uid,
            net_id: meta.net_id,
            last_modified: meta.last_modified,
            visibility_mask: meta.visibility_mask,
            life_stage: meta.life_stage,
        };
        self.live.set(i, true);
        Ok(PvsHandle {
            index,
            generation: self.generations[i],
        })
    }

    /// Mark a handle deleted and queue it for deferred return
    pub fn release(&mut self, handle: PvsHandle) {
        if !self.is_live(handle) {
            return;
        }
        let i = handle.index();
        self.live.set(i, false);
        self.records[i].life_stage = LifeStage::Deleted;
        self.incoming.push(handle);
    }

    /// Advance the deferred-return pipeline. Returns the handles whose
    /// session entries must be cleared before passing them to [`Self::recycle`].
    pub fn take_due_returns(&mut self, tick: GameTick) -> Option<Vec<PvsHandle>> {
        if tick < self.last_rotation.saturating_add(self.return_delay) {
            return None;
        }
        self.last_rotation = tick;
        let due = std::mem::replace(&mut self.pending, std::mem::take(&mut self.incoming));
        (!due.is_empty()).then_some(due)
    }

    /// Put cleared handles back on the free list under a new generation
    pub fn recycle(&mut self, handles: &[PvsHandle]) {
        for handle in handles {
            let i = handle.index();
            if self.generations[i] != handle.generation || self.live[i] {
                continue;
            }
            self.generations[i] = self.generations[i].wrapping_add(1);
            self.free.push(handle.index);
        }
    }

    /// Handles released but not yet back on the free list
    pub fn awaiting_return(&self) -> usize {
        self.incoming.len() + self.pending.len()
    }

    /// Slot is allocated and not deleted
    #[inline]
    pub fn is_live(&self, handle: PvsHandle) -> bool {
        let i = handle.index();
        i < self.records.len() && self.live[i] && self.generations[i] == handle.generation
    }

    /// Slot was not recycled since the handle was issued. Deleted-but-not-yet-returned handles pass.
    #[inline]
    pub fn is_current(&self, handle: PvsHandle) -> bool {
        self.generations
            .get(handle.index())
            .is_some_and(|g| *g == handle.generation)
    }

    #[inline]
    pub fn record(&self, handle: PvsHandle) -> Option<&EntityRecord> {
        if self.is_current(handle) {
            self.records.get(handle.index())
        } else {
            None
        }
    }

    #[inline]
    pub fn record_mut(&mut self, handle: PvsHandle) -> Option<&mut EntityRecord> {
        if self.is_current(handle) {
            self.records.get_mut(handle.index())
        } else {
            None
        }
    }

    /// Drop every entity and shrink back to the initial capacity
    pub fn reset(&mut self) {
        self.records.clear();
        self.generations.clear();
        self.live.clear();
        self.free.clear();
        self.incoming.clear();
        self.pending.clear();
        self.records.shrink_to(self.initial);
        self.resize(self.initial);
    }
}

/// Zero the entries of recycled handles in one session's data
pub fn clear_entries(data: &mut [SessionEntry], handles: &[PvsHandle]) {
    for handle in handles {
        if let Some(entry) = data.get_mut(handle.index()) {
            *entry = SessionEntry::default();
        }
    }
}
