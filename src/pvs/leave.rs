use crate::pvs::history::EntityArena;
use crate::pvs::session::PvsSession;
use crate::world::types::GameTick;

impl PvsSession {
    /// Entities sent on the previous tick but not on this one.
    ///
    /// Fills `left_view` with their net ids and stamps `last_left_view` so
    /// they are treated as entering again if they come back. Deleted
    /// entities are skipped; the deletion list covers them.
    pub fn collect_leaves(&mut self, to_tick: GameTick, arena: &EntityArena) {
        self.left_view.clear();
        let Some((_, previous)) = self.sent_history.back() else {
            return;
        };
        for handle in previous {
            let Some(entry) = self.entity_data.get_mut(handle.index()) else {
                continue;
            };
            if entry.last_sent == to_tick || !arena.is_live(*handle) {
                continue;
            }
            let Some(record) = arena.record(*handle) else {
                continue;
            };
            entry.last_left_view = to_tick;
            self.left_view.push(record.net_id);
        }
        self.stats.leaves = self.left_view.len();
    }
}
