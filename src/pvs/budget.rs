//! Entry classification and the per-tick entry budget.
//!
//! The session walk visits forced entities, overrides and then visible
//! chunks nearest first. Every candidate is classified against what the
//! client has acknowledged and, if it is entering view, charged against
//! the session's `enter` and `new` budgets.

use rustc_hash::FxHashMap;
use tracing::{debug, error, warn};

use crate::pvs::chunk::{ChunkEntry, ChunkIndex, ChunkLocation};
use crate::pvs::history::{EntityArena, PvsHandle, SessionEntry};
use crate::pvs::session::PvsSession;
use crate::pvs::visibility::{resolve_override, OverrideRegistry};
use crate::world::store::EntityStore;
use crate::world::types::{EntityUid, GameTick};

/// How an accepted entity relates to the client's acknowledged view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Client may not have it: send a state relative to its last ack of this entity
    Entered,
    /// Client has it and nothing changed since `from_tick`
    Unchanged,
    /// Client has it but it changed after `from_tick`
    Dirty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Masked,
    ParentNotSent,
    OverBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    AlreadySent,
    Accepted(Classification),
    Rejected(Rejection),
}

/// Ticks a session's delta spans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickWindow {
    pub from_tick: GameTick,
    pub to_tick: GameTick,
}

/// Per-tick limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryBudget {
    pub new_limit: usize,
    pub enter_limit: usize,
}

/// Entities charged so far this tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetCounters {
    pub new_entities: usize,
    pub entering: usize,
}

/// State to build for an accepted entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingState {
    pub uid: EntityUid,
    pub handle: Option<PvsHandle>,
    pub from_tick: GameTick,
    pub send_all: bool,
    pub entered: bool,
}

#[inline]
fn sent_last_tick(entry: &SessionEntry, to_tick: GameTick) -> bool {
    entry.last_sent != 0 && entry.last_sent.wrapping_add(1) == to_tick
}

pub fn classify(entry: &SessionEntry, last_modified: GameTick, window: TickWindow) -> Classification {
    if !sent_last_tick(entry, window.to_tick)
        || entry.last_acked == 0
        || entry.last_acked < window.from_tick
        || entry.last_left_view >= window.from_tick
    {
        Classification::Entered
    } else if last_modified <= window.from_tick {
        Classification::Unchanged
    } else {
        Classification::Dirty
    }
}

/// Decide whether one candidate is sent this tick and update its entry.
///
/// `exempt` candidates (overrides, forced) are never held back by the
/// budget but are still charged, so later budgeted entities see the
/// combined count. A rejected entry is left untouched: it stays "entering"
/// for the next tick it is seen.
pub fn admit(
    entry: &mut SessionEntry,
    parent_sent: bool,
    mask_ok: bool,
    exempt: bool,
    last_modified: GameTick,
    counters: &mut BudgetCounters,
    budget: EntryBudget,
    window: TickWindow,
) -> Admission {
    if entry.last_sent == window.to_tick {
        return Admission::AlreadySent;
    }
    if !mask_ok {
        return Admission::Rejected(Rejection::Masked);
    }
    if !parent_sent {
        return Admission::Rejected(Rejection::ParentNotSent);
    }

    let entering = !sent_last_tick(entry, window.to_tick);
    let never_acked = entry.last_acked == 0;
    if entering && !exempt {
        if counters.entering >= budget.enter_limit {
            return Admission::Rejected(Rejection::OverBudget);
        }
        if never_acked && counters.new_entities >= budget.new_limit {
            return Admission::Rejected(Rejection::OverBudget);
        }
    }
    if entering {
        counters.entering += 1;
        if never_acked {
            counters.new_entities += 1;
        }
    }

    let class = classify(entry, last_modified, window);
    entry.last_sent = window.to_tick;
    Admission::Accepted(class)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    /// Ignores mask and budget
    Forced,
    /// Ignores range and budget, respects mask
    Override,
    Chunk(ChunkLocation),
}

/// Shared, read-only inputs of the per-session walk
pub struct SessionWalk<'a> {
    pub arena: &'a EntityArena,
    pub chunks: &'a ChunkIndex,
    pub overrides: &'a OverrideRegistry,
    pub store: &'a dyn EntityStore,
    pub handles: &'a FxHashMap<EntityUid, PvsHandle>,
    pub budget: EntryBudget,
    pub low_lod_distance: f32,
    pub to_tick: GameTick,
}

impl<'a> SessionWalk<'a> {
    /// Fill `to_send` and `pending` for one culled session
    pub fn run(&self, session: &mut PvsSession) {
        for entry in self.overrides.cached_forced() {
            self.visit(session, entry, Source::Forced);
        }

        let mut scratch: Vec<ChunkEntry> = Vec::new();
        let viewers: Vec<EntityUid> = session.viewers.iter().map(|v| v.uid).collect();
        for uid in self.overrides.session_forced(session.id).into_iter().chain(viewers) {
            if let Err(e) = resolve_override(uid, false, self.store, self.handles, &mut scratch) {
                debug!("Forced entity {:?} for session {} skipped: {}", uid, session.id, e);
            }
        }
        for entry in &scratch {
            self.visit(session, entry, Source::Forced);
        }

        for entry in self.overrides.cached_global() {
            self.visit(session, entry, Source::Override);
        }

        scratch.clear();
        for uid in self.overrides.session_overrides(session.id) {
            if let Err(e) = resolve_override(uid, true, self.store, self.handles, &mut scratch) {
                debug!("Session override {:?} for session {} skipped: {}", uid, session.id, e);
            }
        }
        for entry in &scratch {
            self.visit(session, entry, Source::Override);
        }

        let visible = std::mem::take(&mut session.chunks);
        for chunk in &visible {
            let Some(pvs_chunk) = self.chunks.get(&chunk.location) else {
                continue;
            };
            let contents = if chunk.chebyshev > self.low_lod_distance {
                pvs_chunk.low_lod_contents()
            } else {
                pvs_chunk.contents()
            };
            let Some(contents) = contents else {
                continue;
            };
            for entry in contents {
                self.visit(session, entry, Source::Chunk(chunk.location));
            }
        }
        session.chunks = visible;
    }

    fn visit(&self, session: &mut PvsSession, entry: &ChunkEntry, source: Source) {
        let handle = entry.handle;
        let record = match self.arena.record(handle) {
            Some(record) if self.arena.is_live(handle) => record,
            _ => {
                match source {
                    Source::Chunk(location) => {
                        error!(
                            "Chunk {:?} references deleted entity {:?}, retrying next tick",
                            location, entry.uid
                        );
                        if !session.chunk_retries.contains(&location) {
                            session.chunk_retries.push(location);
                        }
                    }
                    _ => debug!("Override references deleted entity {:?}", entry.uid),
                }
                return;
            }
        };

        if record.life_stage.is_terminating() {
            warn!(
                "Tried to send terminating entity {:?} to session {}, queuing its deletion",
                entry.uid, session.id
            );
            if !session.forced_deletions.contains(&record.net_id) {
                session.forced_deletions.push(record.net_id);
            }
            return;
        }

        let to_tick = self.to_tick;
        let parent_sent = entry.parent.map_or(true, |p| {
            session
                .entity_data
                .get(p.index())
                .is_some_and(|d| d.last_sent == to_tick)
        });
        let (ignore_mask, exempt) = match source {
            Source::Forced => (true, true),
            Source::Override => (false, true),
            Source::Chunk(_) => (false, false),
        };
        let mask_ok = ignore_mask
            || record.visibility_mask & session.visibility_mask == record.visibility_mask;
        let window = TickWindow {
            from_tick: session.from_tick,
            to_tick,
        };

        let Some(data) = session.entity_data.get_mut(handle.index()) else {
            return;
        };
        let last_acked = data.last_acked;
        let admission = admit(
            data,
            parent_sent,
            mask_ok,
            exempt,
            record.last_modified,
            &mut session.budget,
            self.budget,
            window,
        );

        let send_all = session.requested_full;
        match admission {
            Admission::AlreadySent => {}
            Admission::Rejected(Rejection::OverBudget) => session.stats.deferred += 1,
            Admission::Rejected(_) => {}
            Admission::Accepted(class) => {
                session.to_send.push(handle);
                match class {
                    Classification::Entered => {
                        session.stats.entered += 1;
                        session.pending.push(PendingState {
                            uid: entry.uid,
                            handle: Some(handle),
                            from_tick: if send_all { 0 } else { last_acked },
                            send_all,
                            entered: true,
                        });
                    }
                    Classification::Dirty => session.pending.push(PendingState {
                        uid: entry.uid,
                        handle: Some(handle),
                        from_tick: if send_all { 0 } else { window.from_tick },
                        send_all,
                        entered: false,
                    }),
                    Classification::Unchanged => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: EntryBudget = EntryBudget {
        new_limit: 2,
        enter_limit: 3,
    };

    fn window(from_tick: GameTick, to_tick: GameTick) -> TickWindow {
        TickWindow { from_tick, to_tick }
    }

    #[test]
    fn test_classify_never_sent_is_entered() {
        let entry = SessionEntry::default();
        assert_eq!(classify(&entry, 5, window(0, 1)), Classification::Entered);
        assert_eq!(classify(&entry, 5, window(8, 10)), Classification::Entered);
    }

    #[test]
    fn test_classify_unchanged_and_dirty() {
        let entry = SessionEntry {
            last_sent: 9,
            last_left_view: 0,
            last_acked: 8,
        };
        assert_eq!(classify(&entry, 8, window(8, 10)), Classification::Unchanged);
        assert_eq!(classify(&entry, 9, window(8, 10)), Classification::Dirty);
    }

    #[test]
    fn test_classify_entered_conditions() {
        let base = SessionEntry {
            last_sent: 9,
            last_left_view: 0,
            last_acked: 8,
        };
        // Not sent on the previous tick
        let gap = SessionEntry { last_sent: 7, ..base };
        assert_eq!(classify(&gap, 1, window(8, 10)), Classification::Entered);
        // Ack older than the session's from tick
        let stale = SessionEntry { last_acked: 6, ..base };
        assert_eq!(classify(&stale, 1, window(8, 10)), Classification::Entered);
        // Left view at or after from tick
        let left = SessionEntry { last_left_view: 8, ..base };
        assert_eq!(classify(&left, 1, window(8, 10)), Classification::Entered);
    }

    #[test]
    fn test_admit_charges_enter_and_new() {
        let mut counters = BudgetCounters::default();
        let mut entry = SessionEntry::default();
        let result = admit(&mut entry, true, true, false, 1, &mut counters, BUDGET, window(0, 5));
        assert_eq!(result, Admission::Accepted(Classification::Entered));
        assert_eq!(entry.last_sent, 5);
        assert_eq!(counters, BudgetCounters { new_entities: 1, entering: 1 });

        // Same tick again is a no-op
        let again = admit(&mut entry, true, true, false, 1, &mut counters, BUDGET, window(0, 5));
        assert_eq!(again, Admission::AlreadySent);
        assert_eq!(counters.entering, 1);
    }

    #[test]
    fn test_admit_new_budget_exhausted() {
        let mut counters = BudgetCounters {
            new_entities: 2,
            entering: 2,
        };
        let mut fresh = SessionEntry::default();
        let result = admit(&mut fresh, true, true, false, 1, &mut counters, BUDGET, window(0, 5));
        assert_eq!(result, Admission::Rejected(Rejection::OverBudget));
        assert_eq!(fresh, SessionEntry::default());

        // Previously acked entities only need enter budget
        let mut known = SessionEntry {
            last_sent: 2,
            last_left_view: 3,
            last_acked: 2,
        };
        let result = admit(&mut known, true, true, false, 1, &mut counters, BUDGET, window(2, 5));
        assert_eq!(result, Admission::Accepted(Classification::Entered));
        assert_eq!(counters.entering, 3);
    }

    #[test]
    fn test_admit_exempt_is_charged_not_blocked() {
        let mut counters = BudgetCounters {
            new_entities: 2,
            entering: 3,
        };
        let mut entry = SessionEntry::default();
        let result = admit(&mut entry, true, true, true, 1, &mut counters, BUDGET, window(0, 5));
        assert_eq!(result, Admission::Accepted(Classification::Entered));
        assert_eq!(counters, BudgetCounters { new_entities: 3, entering: 4 });
    }

    #[test]
    fn test_admit_continuing_entity_not_charged() {
        let mut counters = BudgetCounters {
            new_entities: 2,
            entering: 3,
        };
        let mut entry = SessionEntry {
            last_sent: 4,
            last_left_view: 0,
            last_acked: 3,
        };
        let result = admit(&mut entry, true, true, false, 4, &mut counters, BUDGET, window(3, 5));
        assert_eq!(result, Admission::Accepted(Classification::Dirty));
        assert_eq!(counters.entering, 3);
    }

    #[test]
    fn test_admit_mask_and_parent() {
        let mut counters = BudgetCounters::default();
        let mut entry = SessionEntry::default();
        assert_eq!(
            admit(&mut entry, true, false, false, 1, &mut counters, BUDGET, window(0, 5)),
            Admission::Rejected(Rejection::Masked)
        );
        assert_eq!(
            admit(&mut entry, false, true, false, 1, &mut counters, BUDGET, window(0, 5)),
            Admission::Rejected(Rejection::ParentNotSent)
        );
        assert_eq!(counters, BudgetCounters::default());
        assert_eq!(entry.last_sent, 0);
    }
}
