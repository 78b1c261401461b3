use tracing::debug;

use crate::world::types::{GameTick, NetEntity};

/// Deleted entities, ordered by deletion tick, kept until every client has
/// acked past them
#[derive(Debug, Default)]
pub struct DeletionHistory {
    entries: Vec<(GameTick, NetEntity)>,
    largest_culled: GameTick,
}

impl DeletionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, tick: GameTick, net_id: NetEntity) {
        // Ticks only move forward, but keep ordering if an event arrives late
        let at = self.entries.partition_point(|(t, _)| *t <= tick);
        self.entries.insert(at, (tick, net_id));
    }

    /// Everything deleted after `from_tick`. A full state (`from_tick == 0`)
    /// carries no deletions.
    pub fn get_deleted(&self, from_tick: GameTick, out: &mut Vec<NetEntity>) {
        if from_tick == 0 {
            return;
        }
        let start = self.entries.partition_point(|(t, _)| *t <= from_tick);
        out.extend(self.entries[start..].iter().map(|(_, id)| *id));
    }

    /// Drop entries at or before `up_to`
    pub fn cull(&mut self, up_to: GameTick) {
        let end = self.entries.partition_point(|(t, _)| *t <= up_to);
        if end == 0 {
            return;
        }
        self.largest_culled = self.largest_culled.max(self.entries[end - 1].0);
        self.entries.drain(..end);
        debug!("Culled {} deletion records up to tick {}", end, up_to);
    }

    /// Newest tick whose deletions were forgotten. A session whose
    /// `from_tick` is older cannot be given a correct delta.
    #[inline]
    pub fn largest_culled(&self) -> GameTick {
        self.largest_culled
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.largest_culled = 0;
    }
}
