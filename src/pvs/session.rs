use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::net::protocol::EntityState;
use crate::pvs::budget::{BudgetCounters, PendingState};
use crate::pvs::chunk::ChunkLocation;
use crate::pvs::history::{PvsHandle, SessionEntry};
use crate::pvs::visibility::{VisibleChunk, Viewer};
use crate::util::pool::ListPool;
use crate::world::types::{EntityUid, GameTick, NetEntity, SessionId, VisMask, DEFAULT_VIS_MASK};

/// Entities sent to a session on one tick
pub type SentList = (GameTick, Vec<PvsHandle>);

/// Per-tick counters, reset at the start of every tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionTickStats {
    pub sent: usize,
    pub entered: usize,
    pub deferred: usize,
    pub states: usize,
    pub empty_diffs: usize,
    pub leaves: usize,
}

/// Server-side replication state of one connected client.
///
/// Everything in here is owned by the session's worker during a tick; no
/// other session touches it.
#[derive(Debug)]
pub struct PvsSession {
    pub id: SessionId,
    pub name: String,
    pub attached: Option<EntityUid>,
    pub view_subscriptions: SmallVec<[EntityUid; 2]>,
    /// `Some(false)` exempts this session from culling
    pub culling: Option<bool>,
    /// Tick the replicated player info last changed
    pub player_modified: GameTick,

    pub viewers: SmallVec<[Viewer; 2]>,
    pub visibility_mask: VisMask,
    /// Chunks overlapped by any viewer, unordered
    pub chunk_locations: Vec<ChunkLocation>,
    /// Visible chunks, nearest first
    pub chunks: Vec<VisibleChunk>,

    /// Per-handle bookkeeping, same length as the entity arena
    pub entity_data: Vec<SessionEntry>,

    pub to_send: Vec<PvsHandle>,
    pub pending: Vec<PendingState>,
    pub states: Vec<EntityState>,
    pub deleted: Vec<NetEntity>,
    /// Terminating entities found during the walk
    pub forced_deletions: Vec<NetEntity>,
    /// Chunks that referenced deleted entities this tick
    pub chunk_retries: Vec<ChunkLocation>,
    pub left_view: Vec<NetEntity>,
    pub budget: BudgetCounters,
    pub stats: SessionTickStats,
    pub payload: Option<Vec<u8>>,

    pub from_tick: GameTick,
    pub force_reliable: bool,
    pub last_received_ack: GameTick,
    pub requested_full: bool,
    pub ack_queued: bool,
    /// Tick of the first state recorded for this session, 0 before that
    pub first_sent: GameTick,
    /// Sent lists of the last `dirty_buffer_size` ticks, oldest first
    pub sent_history: VecDeque<SentList>,
    /// One list that fell out of `sent_history` before being acked
    pub overflow: Option<SentList>,
}

impl PvsSession {
    pub fn new(id: SessionId, name: String, capacity: usize, history_depth: usize) -> Self {
        Self {
            id,
            name,
            attached: None,
            view_subscriptions: SmallVec::new(),
            culling: None,
            player_modified: 0,
            viewers: SmallVec::new(),
            visibility_mask: DEFAULT_VIS_MASK,
            chunk_locations: Vec::new(),
            chunks: Vec::new(),
            entity_data: vec![SessionEntry::default(); capacity],
            to_send: Vec::new(),
            pending: Vec::new(),
            states: Vec::new(),
            deleted: Vec::new(),
            forced_deletions: Vec::new(),
            chunk_retries: Vec::new(),
            left_view: Vec::new(),
            budget: BudgetCounters::default(),
            stats: SessionTickStats::default(),
            payload: None,
            from_tick: 0,
            force_reliable: false,
            last_received_ack: 0,
            requested_full: false,
            ack_queued: false,
            first_sent: 0,
            sent_history: VecDeque::with_capacity(history_depth + 1),
            overflow: None,
        }
    }

    /// Culling applies unless disabled globally or for this session
    #[inline]
    pub fn culls(&self, globally_enabled: bool) -> bool {
        self.culling.unwrap_or(globally_enabled)
    }

    /// Keep `entity_data` in step with the arena capacity
    pub fn resize_data(&mut self, capacity: usize) {
        self.entity_data.resize(capacity, SessionEntry::default());
    }

    #[inline]
    pub fn entry(&self, handle: PvsHandle) -> Option<&SessionEntry> {
        self.entity_data.get(handle.index())
    }

    /// Clear per-tick scratch state
    pub fn begin_tick(&mut self, pool: &ListPool<PvsHandle>) {
        if self.to_send.capacity() == 0 {
            self.to_send = pool.take();
        }
        self.to_send.clear();
        self.pending.clear();
        self.states.clear();
        self.deleted.clear();
        self.forced_deletions.clear();
        self.chunk_retries.clear();
        self.left_view.clear();
        self.budget = BudgetCounters::default();
        self.stats = SessionTickStats::default();
        self.payload = None;
        self.force_reliable = false;
    }

    /// Forget everything this client was sent. Used for full-state
    /// requests, arena resets and deletion-history gaps.
    pub fn wipe_history(&mut self, pool: &ListPool<PvsHandle>) {
        self.entity_data.fill(SessionEntry::default());
        for (_, list) in self.sent_history.drain(..) {
            pool.give(list);
        }
        if let Some((_, list)) = self.overflow.take() {
            pool.give(list);
        }
    }

    /// Hand all pooled lists back on disconnect
    pub fn release(mut self, pool: &ListPool<PvsHandle>) {
        self.wipe_history(pool);
        pool.give(std::mem::take(&mut self.to_send));
    }

    /// Handles sent on the most recent recorded tick
    pub fn last_sent(&self) -> Option<&SentList> {
        self.sent_history.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_culling_override() {
        let mut session = PvsSession::new(Uuid::new_v4(), "a".into(), 4, 20);
        assert!(session.culls(true));
        assert!(!session.culls(false));
        session.culling = Some(false);
        assert!(!session.culls(true));
        session.culling = Some(true);
        assert!(session.culls(false));
    }

    #[test]
    fn test_wipe_history_returns_lists() {
        let pool = ListPool::new(4);
        let mut session = PvsSession::new(Uuid::new_v4(), "a".into(), 4, 20);
        session.entity_data[2].last_acked = 5;
        session.sent_history.push_back((4, Vec::new()));
        session.sent_history.push_back((5, Vec::new()));
        session.overflow = Some((2, Vec::new()));

        session.wipe_history(&pool);
        assert_eq!(pool.pooled(), 3);
        assert!(session.sent_history.is_empty());
        assert!(session.overflow.is_none());
        assert_eq!(session.entity_data[2], SessionEntry::default());
    }

    #[test]
    fn test_resize_data() {
        let mut session = PvsSession::new(Uuid::new_v4(), "a".into(), 4, 20);
        session.resize_data(16);
        assert_eq!(session.entity_data.len(), 16);
        session.resize_data(2);
        assert_eq!(session.entity_data.len(), 2);
    }
}
