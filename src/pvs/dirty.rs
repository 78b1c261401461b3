//! Ring buffers of entities added or modified per tick.
//!
//! Only used to answer "what changed between `from` and `to`" for sessions
//! that are not culled, without enumerating the whole world.

use rustc_hash::FxHashSet;

use crate::world::types::{EntityUid, GameTick};

#[derive(Debug)]
pub struct DirtyBuffers {
    added: Vec<FxHashSet<EntityUid>>,
    dirty: Vec<FxHashSet<EntityUid>>,
    current: GameTick,
    /// First tick whose slot has been recorded since the last reset
    started: GameTick,
}

impl DirtyBuffers {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            added: vec![FxHashSet::default(); depth],
            dirty: vec![FxHashSet::default(); depth],
            current: 0,
            started: 0,
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.added.len()
    }

    #[inline]
    fn slot(&self, tick: GameTick) -> usize {
        tick as usize % self.added.len()
    }

    /// Tick currently being recorded into
    #[inline]
    pub fn current(&self) -> GameTick {
        self.current
    }

    pub fn mark_added(&mut self, uid: EntityUid) {
        let slot = self.slot(self.current);
        self.added[slot].insert(uid);
    }

    pub fn mark_dirty(&mut self, uid: EntityUid) {
        let slot = self.slot(self.current);
        if !self.added[slot].contains(&uid) {
            self.dirty[slot].insert(uid);
        }
    }

    /// Start recording `next_tick`, clearing whatever the slot held
    pub fn rotate(&mut self, next_tick: GameTick) {
        if self.started == 0 {
            self.started = next_tick.max(1);
        }
        self.current = next_tick;
        let slot = self.slot(next_tick);
        self.added[slot].clear();
        self.dirty[slot].clear();
    }

    /// Whether every tick in `from+1..=to` is still held
    pub fn covers(&self, from: GameTick, to: GameTick) -> bool {
        from != 0
            && self.started != 0
            && from < to
            && from.saturating_add(1) >= self.started
            && to <= self.current
            && ((self.current - from) as usize) < self.depth()
    }

    pub fn added(&self, tick: GameTick) -> &FxHashSet<EntityUid> {
        &self.added[self.slot(tick)]
    }

    pub fn dirty(&self, tick: GameTick) -> &FxHashSet<EntityUid> {
        &self.dirty[self.slot(tick)]
    }

    pub fn reset(&mut self) {
        for set in self.added.iter_mut().chain(self.dirty.iter_mut()) {
            set.clear();
        }
        self.started = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_into_current_tick() {
        let mut buffers = DirtyBuffers::new(4);
        buffers.rotate(1);
        buffers.mark_added(EntityUid(1));
        buffers.mark_dirty(EntityUid(1));
        buffers.mark_dirty(EntityUid(2));
        assert!(buffers.added(1).contains(&EntityUid(1)));
        assert!(!buffers.dirty(1).contains(&EntityUid(1)));
        assert!(buffers.dirty(1).contains(&EntityUid(2)));
    }

    #[test]
    fn test_rotation_clears_old_slot() {
        let mut buffers = DirtyBuffers::new(2);
        buffers.rotate(1);
        buffers.mark_dirty(EntityUid(7));
        buffers.rotate(2);
        buffers.rotate(3);
        assert!(buffers.dirty(3).is_empty());
        assert_eq!(buffers.current(), 3);
    }

    #[test]
    fn test_covers() {
        let mut buffers = DirtyBuffers::new(4);
        assert!(!buffers.covers(1, 2));
        for tick in 5..=10 {
            buffers.rotate(tick);
        }
        assert!(buffers.covers(8, 10));
        assert!(buffers.covers(7, 10));
        assert!(!buffers.covers(6, 10));
        assert!(!buffers.covers(0, 10));
        // Slots for 5 and 6 were reused by 9 and 10
        assert!(!buffers.covers(4, 6));
    }

    #[test]
    fn test_covers_from_start() {
        let mut buffers = DirtyBuffers::new(4);
        buffers.rotate(5);
        buffers.rotate(6);
        assert!(buffers.covers(4, 6));
        // Ticks before recording started are unknown
        assert!(!buffers.covers(3, 6));
    }

    #[test]
    fn test_reset_forgets_start() {
        let mut buffers = DirtyBuffers::new(4);
        buffers.rotate(5);
        buffers.rotate(6);
        buffers.reset();
        assert!(!buffers.covers(5, 6));
        buffers.rotate(7);
        assert!(buffers.covers(6, 7));
    }
}
