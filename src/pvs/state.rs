//! Turning a session's accepted entities into a [`GameState`].

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::error;

use crate::net::protocol::{GameState, PlayerState};
use crate::pvs::budget::PendingState;
use crate::pvs::dirty::DirtyBuffers;
use crate::pvs::history::PvsHandle;
use crate::pvs::session::PvsSession;
use crate::world::store::EntityStore;
use crate::world::types::{EntityUid, GameTick};

/// Which enumeration an unculled session went through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enumeration {
    /// Union of the added and dirty buffers for the window
    DirtyBuffers,
    /// Every entity in the store
    Full,
}

/// Ask the store for a state per pending entity.
///
/// A dirty entity whose diff comes back empty means its modification tick
/// and component ticks disagree; it is logged and skipped rather than
/// sent as noise.
pub fn build_states(session: &mut PvsSession, store: &dyn EntityStore) {
    for pending in &session.pending {
        let Some(state) = store.entity_state(pending.uid, pending.from_tick, session.id, pending.send_all)
        else {
            error!(
                "No state for entity {:?} pending for session {}",
                pending.uid, session.id
            );
            continue;
        };
        if state.is_empty() && !pending.entered && !pending.send_all {
            error!(
                "Dirty entity {:?} produced an empty diff from tick {} for session {}",
                pending.uid, pending.from_tick, session.id
            );
            session.stats.empty_diffs += 1;
            continue;
        }
        session.states.push(state);
    }
    session.stats.states = session.states.len();
}

/// Fill `session.pending` for a session that sees everything.
///
/// Uses the dirty buffers when they cover the whole window, otherwise
/// scans the store. Either way only live entities modified after
/// `from_tick` are kept.
pub fn collect_unculled(
    session: &mut PvsSession,
    store: &dyn EntityStore,
    dirty: &DirtyBuffers,
    handles: &FxHashMap<EntityUid, PvsHandle>,
    to_tick: GameTick,
) -> Enumeration {
    let from = session.from_tick;
    let send_all = session.requested_full;
    let keep = |uid: EntityUid| {
        store
            .meta(uid)
            .is_some_and(|m| !m.life_stage.is_terminating() && m.last_modified > from)
    };

    session.pending.clear();
    let path = if !send_all && dirty.covers(from, to_tick) {
        let mut seen: FxHashSet<EntityUid> = FxHashSet::default();
        for tick in from + 1..=to_tick {
            for &uid in dirty.added(tick) {
                if seen.insert(uid) && keep(uid) {
                    session.pending.push(PendingState {
                        uid,
                        handle: handles.get(&uid).copied(),
                        from_tick: 0,
                        send_all: false,
                        entered: true,
                    });
                }
            }
        }
        for tick in from + 1..=to_tick {
            for &uid in dirty.dirty(tick) {
                if seen.insert(uid) && keep(uid) {
                    session.pending.push(PendingState {
                        uid,
                        handle: handles.get(&uid).copied(),
                        from_tick: from,
                        send_all: false,
                        entered: false,
                    });
                }
            }
        }
        Enumeration::DirtyBuffers
    } else {
        let pending = &mut session.pending;
        store.for_each_entity(&mut |uid| {
            if send_all || keep(uid) {
                pending.push(PendingState {
                    uid,
                    handle: handles.get(&uid).copied(),
                    from_tick: if send_all { 0 } else { from },
                    send_all,
                    entered: from == 0,
                });
            }
        });
        Enumeration::Full
    };

    session.pending.sort_unstable_by_key(|p| p.uid);
    path
}

/// Player info of every session, built once per tick
pub fn player_states<'a>(
    sessions: impl Iterator<Item = &'a PvsSession>,
    store: &dyn EntityStore,
) -> Vec<PlayerState> {
    sessions
        .map(|s| PlayerState {
            session: s.id,
            name: s.name.clone(),
            attached: s.attached.and_then(|uid| store.meta(uid)).map(|m| m.net_id),
            last_modified: s.player_modified,
        })
        .collect()
}

/// Player states changed since `from_tick`; all of them for a full state
pub fn players_since(all: &[PlayerState], from_tick: GameTick) -> Vec<PlayerState> {
    all.iter()
        .filter(|p| from_tick == 0 || p.last_modified > from_tick)
        .cloned()
        .collect()
}

/// Assemble the outgoing message, draining the session's per-tick buffers
pub fn assemble(session: &mut PvsSession, players: Vec<PlayerState>, to_tick: GameTick) -> GameState {
    let mut deleted = std::mem::take(&mut session.deleted);
    deleted.extend(session.forced_deletions.iter().copied());
    deleted.sort_unstable();
    deleted.dedup();

    GameState {
        from_tick: session.from_tick,
        to_tick,
        entity_states: std::mem::take(&mut session.states),
        player_states: players,
        deleted_entities: deleted,
        force_send_reliably: session.force_reliable,
    }
}
