//! Client acknowledgements and the per-session sent history.

use tracing::{debug, warn};

use crate::pvs::history::{EntityArena, PvsHandle, SessionEntry};
use crate::pvs::session::PvsSession;
use crate::util::pool::ListPool;
use crate::world::types::{GameTick, NetEntity};

fn apply_ack(list: &[PvsHandle], data: &mut [SessionEntry], arena: &EntityArena, ack: GameTick) -> usize {
    let mut applied = 0;
    for handle in list {
        if !arena.is_current(*handle) {
            continue;
        }
        if let Some(entry) = data.get_mut(handle.index()) {
            if entry.last_acked < ack {
                entry.last_acked = ack;
                applied += 1;
            }
        }
    }
    applied
}

/// Result of applying a queued ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Nothing new was received since the last pass
    Idle,
    /// Entities of the acked tick were marked acknowledged
    Applied { entities: usize },
    /// The acked tick's sent list was already gone
    Dropped,
}

impl PvsSession {
    /// Record an ack from the client. Stale and duplicate acks are ignored.
    pub fn receive_ack(&mut self, tick: GameTick) -> bool {
        if tick <= self.last_received_ack {
            return false;
        }
        self.last_received_ack = tick;
        self.ack_queued = true;
        self.requested_full = false;
        true
    }

    /// Apply the latest received ack to the per-entity history
    pub fn process_ack(&mut self, arena: &EntityArena, pool: &ListPool<PvsHandle>) -> AckOutcome {
        if !self.ack_queued {
            return AckOutcome::Idle;
        }
        self.ack_queued = false;
        let ack = self.last_received_ack;

        while self.sent_history.front().is_some_and(|(tick, _)| *tick < ack) {
            if let Some((_, list)) = self.sent_history.pop_front() {
                pool.give(list);
            }
        }
        if self.overflow.as_ref().is_some_and(|(tick, _)| *tick < ack) {
            if let Some((_, stale)) = self.overflow.take() {
                pool.give(stale);
            }
        }

        // The acked list itself stays: it is also last tick's visible set
        let entities = if self.sent_history.front().is_some_and(|(tick, _)| *tick == ack) {
            let (_, list) = &self.sent_history[0];
            apply_ack(list, &mut self.entity_data, arena, ack)
        } else if self.overflow.as_ref().is_some_and(|(tick, _)| *tick == ack) {
            let Some((_, list)) = self.overflow.take() else {
                return AckOutcome::Dropped;
            };
            let applied = apply_ack(&list, &mut self.entity_data, arena, ack);
            pool.give(list);
            applied
        } else {
            debug!("Session {} acked tick {} with no sent list left", self.id, ack);
            return AckOutcome::Dropped;
        };

        AckOutcome::Applied { entities }
    }

    /// Pick the delta base for this tick and decide reliability.
    ///
    /// A client more than `threshold` ticks behind gets a reliable state.
    pub fn begin_window(&mut self, to_tick: GameTick, threshold: GameTick) {
        self.from_tick = if self.requested_full {
            0
        } else {
            self.last_received_ack
        };
        let lagging = self.from_tick != 0 && to_tick.saturating_sub(self.from_tick) > threshold;
        self.force_reliable = self.from_tick == 0 || lagging;
    }

    /// Move this tick's `to_send` into the sent history.
    ///
    /// A list pushed out of the ring is parked in the overflow slot when the
    /// slot is free and the client has not acked past it yet, so a client
    /// lagging beyond the ring still gets an ack through now and then.
    pub fn record_sent(&mut self, to_tick: GameTick, depth: usize, pool: &ListPool<PvsHandle>) {
        let list = std::mem::replace(&mut self.to_send, pool.take());
        self.sent_history.push_back((to_tick, list));
        if self.first_sent == 0 {
            self.first_sent = to_tick;
        }
        while self.sent_history.len() > depth.max(1) {
            let Some((tick, evicted)) = self.sent_history.pop_front() else {
                break;
            };
            if self.overflow.is_none() && tick > self.last_received_ack {
                debug!("Session {} exceeded the sent history, parking tick {}", self.id, tick);
                self.overflow = Some((tick, evicted));
            } else {
                pool.give(evicted);
            }
        }
    }

    /// Newest tick whose deletions this client can no longer need.
    ///
    /// Every future ack is at least the last one received. A client that
    /// never acked will first ack no earlier than its first recorded state,
    /// or a later tick still if nothing was recorded yet.
    pub fn deletion_floor(&self, to_tick: GameTick) -> GameTick {
        if self.last_received_ack != 0 {
            self.last_received_ack
        } else if self.first_sent != 0 {
            self.first_sent
        } else {
            to_tick
        }
    }

    /// Client asked to start over. The next state is a full one from tick 0
    /// and all acknowledgement history is forgotten.
    pub fn request_full(&mut self, last_tick: GameTick, missing: Option<NetEntity>, pool: &ListPool<PvsHandle>) {
        match missing {
            Some(net_id) => warn!(
                "Session {} requested full state, missing entity {:?}",
                self.id, net_id
            ),
            None => debug!("Session {} requested full state", self.id),
        }
        self.last_received_ack = last_tick;
        self.ack_queued = false;
        self.requested_full = true;
        self.wipe_history(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::types::{EntityMeta, EntityUid, LifeStage};
    use uuid::Uuid;

    fn setup() -> (EntityArena, Vec<PvsHandle>, PvsSession, ListPool<PvsHandle>) {
        let mut arena = EntityArena::new(8, 8, 64, 5);
        let handles = (1..=3)
            .map(|i| {
                let meta = EntityMeta {
                    net_id: NetEntity(i),
                    visibility_mask: 1,
                    life_stage: LifeStage::Alive,
                    last_modified: 1,
                };
                arena.allocate(EntityUid(i), &meta).unwrap()
            })
            .collect();
        let session = PvsSession::new(Uuid::new_v4(), "p".into(), arena.capacity(), 4);
        (arena, handles, session, ListPool::new(4))
    }

    #[test]
    fn test_ack_marks_sent_entities() {
        let (arena, handles, mut session, pool) = setup();
        session.to_send.extend_from_slice(&handles[..2]);
        session.record_sent(5, 4, &pool);

        assert!(session.receive_ack(5));
        assert_eq!(session.process_ack(&arena, &pool), AckOutcome::Applied { entities: 2 });
        assert_eq!(session.entry(handles[0]).unwrap().last_acked, 5);
        assert_eq!(session.entry(handles[2]).unwrap().last_acked, 0);
        // Kept as the previous tick's set until a newer ack arrives
        assert_eq!(session.sent_history.len(), 1);
    }

    #[test]
    fn test_duplicate_and_stale_acks_ignored() {
        let (arena, handles, mut session, pool) = setup();
        session.to_send.push(handles[0]);
        session.record_sent(5, 4, &pool);
        session.to_send.push(handles[0]);
        session.record_sent(6, 4, &pool);

        assert!(session.receive_ack(6));
        session.process_ack(&arena, &pool);
        let before = session.entry(handles[0]).copied();

        assert!(!session.receive_ack(6));
        assert!(!session.receive_ack(5));
        assert_eq!(session.process_ack(&arena, &pool), AckOutcome::Idle);
        assert_eq!(session.entry(handles[0]).copied(), before);
        assert_eq!(session.last_received_ack, 6);
        assert_eq!(session.sent_history.len(), 1);
    }

    #[test]
    fn test_overflow_list_still_ackable() {
        let (arena, handles, mut session, pool) = setup();
        for tick in 1..=5 {
            session.to_send.push(handles[0]);
            session.record_sent(tick, 4, &pool);
        }
        assert_eq!(session.sent_history.len(), 4);
        assert_eq!(session.overflow.as_ref().map(|(t, _)| *t), Some(1));

        session.receive_ack(1);
        assert_eq!(session.process_ack(&arena, &pool), AckOutcome::Applied { entities: 1 });
        assert!(session.overflow.is_none());
    }

    #[test]
    fn test_ack_past_history_is_dropped() {
        let (arena, handles, mut session, pool) = setup();
        session.to_send.push(handles[0]);
        session.record_sent(5, 4, &pool);

        session.receive_ack(3);
        assert_eq!(session.process_ack(&arena, &pool), AckOutcome::Dropped);
        assert_eq!(session.entry(handles[0]).unwrap().last_acked, 0);
        // The newer list is kept for a later ack
        assert_eq!(session.sent_history.len(), 1);
    }

    #[test]
    fn test_recycled_handle_not_acked() {
        let (mut arena, handles, mut session, pool) = setup();
        session.to_send.push(handles[1]);
        session.record_sent(2, 4, &pool);

        arena.release(handles[1]);
        arena.take_due_returns(5);
        let due = arena.take_due_returns(10).unwrap();
        arena.recycle(&due);

        session.receive_ack(2);
        assert_eq!(session.process_ack(&arena, &pool), AckOutcome::Applied { entities: 0 });
    }

    #[test]
    fn test_window_and_reliability() {
        let (_, _, mut session, _) = setup();
        session.begin_window(3, 40);
        assert_eq!(session.from_tick, 0);
        assert!(session.force_reliable);

        session.receive_ack(10);
        session.begin_window(12, 40);
        assert_eq!(session.from_tick, 10);
        assert!(!session.force_reliable);

        session.begin_window(60, 40);
        assert!(session.force_reliable);
    }

    #[test]
    fn test_request_full_resets() {
        let (arena, handles, mut session, pool) = setup();
        session.to_send.push(handles[0]);
        session.record_sent(4, 4, &pool);
        session.receive_ack(4);
        session.process_ack(&arena, &pool);

        session.request_full(7, None, &pool);
        assert!(session.requested_full);
        assert_eq!(session.entry(handles[0]).unwrap().last_acked, 0);
        session.begin_window(8, 40);
        assert_eq!(session.from_tick, 0);

        // Acks older than the request are ignored
        assert!(!session.receive_ack(6));
        assert!(session.receive_ack(8));
        assert!(!session.requested_full);
    }

    #[test]
    fn test_overflow_slot_kept_until_acked() {
        let (_, handles, mut session, pool) = setup();
        for tick in 1..=7 {
            session.to_send.push(handles[0]);
            session.record_sent(tick, 4, &pool);
        }
        // Ticks 2 and 3 were evicted while tick 1 held the slot
        assert_eq!(session.overflow.as_ref().map(|(t, _)| *t), Some(1));
        assert_eq!(session.sent_history.front().map(|(t, _)| *t), Some(4));
    }

    #[test]
    fn test_overflow_skips_already_acked_ticks() {
        let (arena, handles, mut session, pool) = setup();
        for tick in 1..=4 {
            session.to_send.push(handles[0]);
            session.record_sent(tick, 4, &pool);
        }
        session.receive_ack(2);
        session.process_ack(&arena, &pool);

        for tick in 5..=6 {
            session.to_send.push(handles[0]);
            session.record_sent(tick, 4, &pool);
        }
        // Tick 2 fell out of the ring but was already acked
        assert_eq!(session.sent_history.front().map(|(t, _)| *t), Some(3));
        assert!(session.overflow.is_none());
    }

    #[test]
    fn test_lagging_client_makes_ack_progress() {
        let (arena, handles, mut session, pool) = setup();
        let mut applied = 0;
        for tick in 1..=60 {
            if tick > 6 {
                session.receive_ack(tick - 6);
                if let AckOutcome::Applied { .. } = session.process_ack(&arena, &pool) {
                    applied += 1;
                }
            }
            session.to_send.push(handles[0]);
            session.record_sent(tick, 4, &pool);
        }
        assert!(applied > 0);
        assert!(session.entry(handles[0]).unwrap().last_acked > 40);
    }

    #[test]
    fn test_deletion_floor_before_first_ack() {
        let (_, handles, mut session, pool) = setup();
        assert_eq!(session.deletion_floor(4), 4);

        session.to_send.push(handles[0]);
        session.record_sent(5, 4, &pool);
        session.to_send.push(handles[0]);
        session.record_sent(6, 4, &pool);
        assert_eq!(session.deletion_floor(6), 5);

        session.receive_ack(6);
        assert_eq!(session.deletion_floor(9), 6);
    }

    #[test]
    fn test_skipped_overflow_tick_frees_slot() {
        let (arena, handles, mut session, pool) = setup();
        for tick in 1..=6 {
            session.to_send.push(handles[0]);
            session.record_sent(tick, 4, &pool);
        }
        assert_eq!(session.overflow.as_ref().map(|(t, _)| *t), Some(1));

        // Tick 2 went back to the pool, so this ack matches nothing
        session.receive_ack(2);
        assert_eq!(session.process_ack(&arena, &pool), AckOutcome::Dropped);
        assert!(session.overflow.is_none());

        session.to_send.push(handles[0]);
        session.record_sent(7, 4, &pool);
        assert_eq!(session.overflow.as_ref().map(|(t, _)| *t), Some(3));
    }
}
