//! Per-tick replication driver.
//!
//! [`PvsSystem::update`] runs the stages below strictly in order. Each
//! parallel stage is a fork-join over sessions (or chunks), so no stage
//! overlaps the next and nothing shared is written while it is read.
//!
//! 0. drain queued world / session events
//! 1. apply acks, pick each session's delta window
//! 2. viewers, visible chunks, chunk rebuilds, chunk ranking
//! 3. per-session walk, budget and state building
//! 4. serialize
//! 5. send
//! 6. leave notifications
//! 7. sent history, handle returns, deletion history

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Receiver;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::config::PvsConfig;
use crate::error::PvsError;
use crate::metrics::PvsMetrics;
use crate::net::protocol::{encode, LeavePvsMessage, ServerMessage};
use crate::net::transport::StateTransport;
use crate::pvs::ack::AckOutcome;
use crate::pvs::budget::{EntryBudget, SessionWalk};
use crate::pvs::chunk::{ChunkIndex, ChunkLocation};
use crate::pvs::deletion::DeletionHistory;
use crate::pvs::dirty::DirtyBuffers;
use crate::pvs::history::{clear_entries, EntityArena, PvsHandle, SessionEntry};
use crate::pvs::session::PvsSession;
use crate::pvs::state::{assemble, build_states, collect_unculled, player_states, players_since};
use crate::pvs::visibility::{gather_visible_chunks, rank_chunks, OverrideRegistry, VisibleChunk};
use crate::util::parallel::parallel_for;
use crate::util::pool::ListPool;
use crate::world::events::{EventSink, PvsEvent};
use crate::world::store::EntityStore;
use crate::world::types::{EntityUid, GameTick, LifeStage, RootKind, SessionId};

/// Session count above which recycled handles are cleared in parallel
const PARALLEL_CLEAR_SESSIONS: usize = 16;

pub struct PvsSystem {
    config: PvsConfig,
    transport: Arc<dyn StateTransport>,
    metrics: Arc<PvsMetrics>,

    events: Receiver<PvsEvent>,
    sink: EventSink,

    arena: EntityArena,
    handles: FxHashMap<EntityUid, PvsHandle>,
    chunks: ChunkIndex,
    overrides: OverrideRegistry,

    sessions: Vec<PvsSession>,
    session_index: FxHashMap<SessionId, usize>,

    deletions: DeletionHistory,
    dirty: DirtyBuffers,
    list_pool: ListPool<PvsHandle>,

    /// Last tick `update` completed
    last_tick: GameTick,
}

impl PvsSystem {
    pub fn new(config: PvsConfig, transport: Arc<dyn StateTransport>) -> Result<Self, PvsError> {
        config.validate().map_err(PvsError::InvalidConfig)?;
        let (sink, events) = EventSink::channel();

        info!(
            "PVS enabled: culling={}, view_range={}, budget={}/{}, history={} ticks",
            config.culling_enabled,
            config.view_range,
            config.new_entity_budget,
            config.enter_entity_budget,
            config.dirty_buffer_size
        );

        Ok(Self {
            arena: EntityArena::new(
                config.entity_initial,
                config.entity_growth,
                config.entity_max,
                config.handle_return_delay(),
            ),
            handles: FxHashMap::default(),
            chunks: ChunkIndex::new(),
            overrides: OverrideRegistry::new(),
            sessions: Vec::with_capacity(config.session_initial),
            session_index: FxHashMap::default(),
            deletions: DeletionHistory::new(),
            dirty: DirtyBuffers::new(config.dirty_buffer_size),
            list_pool: ListPool::new(256),
            last_tick: 0,
            metrics: Arc::new(PvsMetrics::new()),
            transport,
            events,
            sink,
            config,
        })
    }

    /// Producer handle for world and session events
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    pub fn metrics(&self) -> Arc<PvsMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &PvsConfig {
        &self.config
    }

    pub fn last_tick(&self) -> GameTick {
        self.last_tick
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn session(&self, id: SessionId) -> Option<&PvsSession> {
        self.session_index.get(&id).and_then(|i| self.sessions.get(*i))
    }

    fn session_mut(&mut self, id: SessionId) -> Option<&mut PvsSession> {
        let i = *self.session_index.get(&id)?;
        self.sessions.get_mut(i)
    }

    pub fn handle_of(&self, uid: EntityUid) -> Option<PvsHandle> {
        self.handles.get(&uid).copied()
    }

    pub fn tracked_entities(&self) -> usize {
        self.handles.len()
    }

    pub fn arena_capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn chunk_index(&self) -> &ChunkIndex {
        &self.chunks
    }

    pub fn deletion_history(&self) -> &DeletionHistory {
        &self.deletions
    }

    /// Entities accepted for `session` on the last completed tick
    pub fn sent_entities(&self, session: SessionId) -> Vec<EntityUid> {
        let Some(s) = self.session(session) else {
            return Vec::new();
        };
        let mut out: Vec<EntityUid> = s
            .last_sent()
            .filter(|(tick, _)| *tick == self.last_tick)
            .map(|(_, list)| {
                list.iter()
                    .filter_map(|h| self.arena.record(*h).map(|r| r.uid))
                    .collect()
            })
            .unwrap_or_default();
        out.sort_unstable();
        out
    }

    pub fn session_entry(&self, session: SessionId, uid: EntityUid) -> Option<SessionEntry> {
        let handle = self.handle_of(uid)?;
        self.session(session)?.entry(handle).copied()
    }

    pub fn last_received_ack(&self, session: SessionId) -> Option<GameTick> {
        self.session(session).map(|s| s.last_received_ack)
    }

    pub fn visible_chunks(&self, session: SessionId) -> Vec<VisibleChunk> {
        self.session(session).map(|s| s.chunks.clone()).unwrap_or_default()
    }

    /// Sent lists retained for acks, including the overflow slot
    pub fn retained_history(&self, session: SessionId) -> usize {
        self.session(session)
            .map(|s| s.sent_history.len() + usize::from(s.overflow.is_some()))
            .unwrap_or(0)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Apply every queued event. Stamped with `tick`, the tick being built.
    pub fn drain_events(&mut self, store: &dyn EntityStore, tick: GameTick) -> Result<(), PvsError> {
        while let Ok(event) = self.events.try_recv() {
            self.apply_event(store, tick, event)?;
        }
        Ok(())
    }

    fn apply_event(&mut self, store: &dyn EntityStore, tick: GameTick, event: PvsEvent) -> Result<(), PvsError> {
        match event {
            PvsEvent::EntityAdded { uid } => {
                self.track_entity(store, uid)?;
            }
            PvsEvent::EntityTerminating { uid } => {
                if let Some(record) = self.handle_of(uid).and_then(|h| self.arena.record_mut(h)) {
                    record.life_stage = record.life_stage.max(LifeStage::Terminating);
                }
            }
            PvsEvent::EntityDeleted { uid, parent } => self.untrack_entity(store, uid, parent, tick),
            PvsEvent::EntityMoved { uid, old_parent } => {
                if let Some(old) = old_parent {
                    self.mark_ancestor_chunk_dirty(store, old);
                }
                self.update_entity_chunk(store, uid, old_parent.is_some());
            }
            PvsEvent::EntityDirty { uid, tick: modified } => {
                if let Some(record) = self.handle_of(uid).and_then(|h| self.arena.record_mut(h)) {
                    record.last_modified = record.last_modified.max(modified);
                }
                self.dirty.mark_dirty(uid);
            }
            PvsEvent::VisibilityChanged { uid, mask } => {
                if let Some(record) = self.handle_of(uid).and_then(|h| self.arena.record_mut(h)) {
                    record.visibility_mask = mask;
                }
            }

            PvsEvent::RootAdded { uid } => self.overrides.add_forced(None, uid),
            PvsEvent::RootRemoved { uid } => {
                self.overrides.remove_forced(None, uid);
                let removed = self.chunks.remove_root(uid);
                debug!("Root {:?} removed with {} chunks", uid, removed);
            }

            PvsEvent::SessionConnected { session, name } => self.add_session(session, name, tick),
            PvsEvent::SessionDisconnected { session } => self.remove_session(session),
            PvsEvent::Attached { session, entity } => {
                if let Some(s) = self.session_mut(session) {
                    s.attached = entity;
                    s.player_modified = tick;
                }
            }
            PvsEvent::PlayerRenamed { session, name } => {
                if let Some(s) = self.session_mut(session) {
                    s.name = name;
                    s.player_modified = tick;
                }
            }
            PvsEvent::ViewSubscriptionAdded { session, entity } => {
                if let Some(s) = self.session_mut(session) {
                    if !s.view_subscriptions.contains(&entity) {
                        s.view_subscriptions.push(entity);
                    }
                }
            }
            PvsEvent::ViewSubscriptionRemoved { session, entity } => {
                if let Some(s) = self.session_mut(session) {
                    s.view_subscriptions.retain(|v| *v != entity);
                }
            }
            PvsEvent::SessionCulling { session, enabled } => {
                let (global, last_tick) = (self.config.culling_enabled, self.last_tick);
                let Some(i) = self.session_index.get(&session).copied() else {
                    return Ok(());
                };
                let s = &mut self.sessions[i];
                let was = s.culls(global);
                s.culling = Some(enabled);
                if was != enabled {
                    // Per-entity history is only kept while culled
                    s.request_full(last_tick, None, &self.list_pool);
                }
            }

            PvsEvent::ClientAck { session, tick: acked } => {
                let last_tick = self.last_tick;
                match self.session_mut(session) {
                    Some(_) if acked > last_tick => {
                        warn!("Session {} acked future tick {} (last {})", session, acked, last_tick);
                    }
                    Some(s) => {
                        s.receive_ack(acked);
                    }
                    None => debug!("Ack from unknown session {}", session),
                }
            }
            PvsEvent::RequestFullState { session, tick: _, missing } => {
                let last_tick = self.last_tick;
                let Some(i) = self.session_index.get(&session).copied() else {
                    return Ok(());
                };
                self.sessions[i].request_full(last_tick, missing, &self.list_pool);
            }

            PvsEvent::AddGlobalOverride { uid, recursive } => self.overrides.add_global(uid, recursive),
            PvsEvent::RemoveGlobalOverride { uid } => self.overrides.remove_global(uid),
            PvsEvent::AddSessionOverride { session, uid } => self.overrides.add_session(session, uid),
            PvsEvent::RemoveSessionOverride { session, uid } => self.overrides.remove_session(session, uid),
            PvsEvent::AddForcedOverride { session, uid } => self.overrides.add_forced(session, uid),
            PvsEvent::RemoveForcedOverride { session, uid } => self.overrides.remove_forced(session, uid),
        }
        Ok(())
    }

    fn add_session(&mut self, id: SessionId, name: String, tick: GameTick) {
        if self.session_index.contains_key(&id) {
            warn!("Session {} connected twice", id);
            return;
        }
        if self.sessions.len() == self.sessions.capacity() {
            let growth = self.config.session_growth.max(1);
            warn!(
                "Growing PVS session storage {} -> {}",
                self.sessions.capacity(),
                self.sessions.capacity() + growth
            );
            self.sessions.reserve_exact(growth);
        }

        let mut session = PvsSession::new(id, name, self.arena.capacity(), self.config.dirty_buffer_size);
        session.player_modified = tick;
        self.session_index.insert(id, self.sessions.len());
        self.sessions.push(session);
        info!("Session {} joined PVS ({} total)", id, self.sessions.len());
    }

    fn remove_session(&mut self, id: SessionId) {
        let Some(i) = self.session_index.remove(&id) else {
            return;
        };
        let session = self.sessions.swap_remove(i);
        if let Some(moved) = self.sessions.get(i) {
            self.session_index.insert(moved.id, i);
        }
        self.overrides.remove_session_all(id);
        session.release(&self.list_pool);
        info!("Session {} left PVS ({} remaining)", id, self.sessions.len());
    }

    /// Give a new entity a handle and a chunk
    fn track_entity(&mut self, store: &dyn EntityStore, uid: EntityUid) -> Result<(), PvsError> {
        if self.handles.contains_key(&uid) {
            return Ok(());
        }
        let Some(meta) = store.meta(uid) else {
            debug!("Entity {:?} deleted before it was tracked", uid);
            return Ok(());
        };

        let before = self.arena.capacity();
        let handle = self.arena.allocate(uid, &meta)?;
        let capacity = self.arena.capacity();
        if capacity != before {
            for s in &mut self.sessions {
                s.resize_data(capacity);
            }
        }
        self.handles.insert(uid, handle);
        self.dirty.mark_added(uid);
        self.update_entity_chunk(store, uid, true);
        Ok(())
    }

    fn untrack_entity(&mut self, store: &dyn EntityStore, uid: EntityUid, parent: Option<EntityUid>, tick: GameTick) {
        let Some(handle) = self.handles.remove(&uid) else {
            return;
        };
        if let Some(record) = self.arena.record(handle) {
            self.deletions.add(tick, record.net_id);
        }
        self.arena.release(handle);
        self.overrides.remove_entity(uid);

        if self.chunks.remove_entity(uid).is_none() {
            if let Some(parent) = parent {
                self.mark_ancestor_chunk_dirty(store, parent);
            }
        }
    }

    /// Re-bucket an entity after it moved or was created.
    ///
    /// Direct children of a root live in that root's chunks; anything
    /// deeper is carried by the chunk of its root-level ancestor, which
    /// only changes when the hierarchy does (`structural`).
    fn update_entity_chunk(&mut self, store: &dyn EntityStore, uid: EntityUid, structural: bool) {
        if store.is_root(uid) {
            return;
        }
        let Some(parent) = store.parent(uid) else {
            return;
        };

        match store.root_kind(parent) {
            Some(kind) => {
                let Some(local) = store.local_position(uid) else {
                    return;
                };
                let map = match kind {
                    RootKind::Map => parent,
                    RootKind::Grid { map } => map,
                };
                self.chunks.add_entity(uid, ChunkLocation::containing(parent, local), map);
            }
            None => {
                self.chunks.remove_entity(uid);
                if structural {
                    self.mark_ancestor_chunk_dirty(store, parent);
                }
            }
        }
    }

    /// Dirty the chunk carrying `start` or its nearest chunked ancestor
    fn mark_ancestor_chunk_dirty(&mut self, store: &dyn EntityStore, start: EntityUid) {
        let mut current = Some(start);
        while let Some(uid) = current {
            if self.chunks.mark_entity_chunk_dirty(uid) {
                return;
            }
            current = store.parent(uid);
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Track every entity already in `store`, parents first
    pub fn initialize(&mut self, store: &dyn EntityStore) -> Result<(), PvsError> {
        let mut entities: Vec<(usize, EntityUid)> = Vec::new();
        store.for_each_entity(&mut |uid| {
            let mut depth = 0;
            let mut current = store.parent(uid);
            while let Some(p) = current {
                depth += 1;
                current = store.parent(p);
            }
            entities.push((depth, uid));
        });
        entities.sort_unstable();

        for &(_, uid) in &entities {
            self.track_entity(store, uid)?;
            if store.is_root(uid) {
                self.overrides.add_forced(None, uid);
            }
        }
        info!("PVS tracking {} entities", entities.len());
        Ok(())
    }

    /// Drop all replication state once the world has been emptied.
    ///
    /// Does nothing and returns `Ok(false)` while `store` still holds
    /// entities. Every session receives a full state next tick.
    pub fn after_entity_flush(&mut self, store: &dyn EntityStore) -> Result<bool, PvsError> {
        let mut remaining = 0usize;
        store.for_each_entity(&mut |_| remaining += 1);
        if remaining > 0 {
            warn!("PVS reset skipped: {} entities still in the world", remaining);
            return Ok(false);
        }

        // Deletions from the flush itself, plus any session traffic
        self.drain_events(store, self.last_tick.saturating_add(1))?;

        self.arena.reset();
        self.handles.clear();
        self.chunks.clear();
        self.overrides.clear();
        self.deletions.clear();
        self.dirty.reset();

        let capacity = self.arena.capacity();
        let last_tick = self.last_tick;
        for s in &mut self.sessions {
            s.resize_data(capacity);
            s.request_full(last_tick, None, &self.list_pool);
        }
        info!("PVS state reset after entity flush");
        Ok(true)
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Build and send every session's state for `to_tick`
    pub fn update(&mut self, store: &dyn EntityStore, to_tick: GameTick) -> Result<(), PvsError> {
        if to_tick <= self.last_tick {
            return Err(PvsError::TimeTravel {
                current: self.last_tick,
                requested: to_tick,
            });
        }
        let started = Instant::now();

        if self.dirty.current() != to_tick {
            self.dirty.rotate(to_tick);
        }
        self.drain_events(store, to_tick)?;

        self.process_acks(to_tick);
        self.refresh_chunks(store);
        self.resolve_sessions(store, to_tick);
        self.serialize(store, to_tick);
        self.send(to_tick);
        self.dispatch_leaves(to_tick);
        self.cleanup(to_tick);

        self.last_tick = to_tick;
        self.metrics.sessions.store(self.sessions.len() as u64, Ordering::Relaxed);
        self.metrics.tracked_entities.store(self.handles.len() as u64, Ordering::Relaxed);
        self.metrics.chunks.store(self.chunks.len() as u64, Ordering::Relaxed);
        self.metrics.record_tick_time(started.elapsed());
        Ok(())
    }

    /// Stage 1
    fn process_acks(&mut self, to_tick: GameTick) {
        let arena = &self.arena;
        let pool = &self.list_pool;
        let deletions = &self.deletions;
        let threshold = self.config.force_ack_threshold;
        let last_tick = self.last_tick;
        let applied = AtomicUsize::new(0);
        let dropped = AtomicUsize::new(0);

        parallel_for(&mut self.sessions, self.config.parallel_batch_size, |s| {
            match s.process_ack(arena, pool) {
                AckOutcome::Applied { .. } => {
                    applied.fetch_add(1, Ordering::Relaxed);
                }
                AckOutcome::Dropped => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
                AckOutcome::Idle => {}
            }
            s.begin_tick(pool);
            s.begin_window(to_tick, threshold);

            if s.from_tick != 0 && deletions.largest_culled() > s.from_tick {
                error!(
                    "Deletion history culled to tick {} but session {} needs it from {}, forcing full state",
                    deletions.largest_culled(),
                    s.id,
                    s.from_tick
                );
                s.request_full(last_tick, None, pool);
                s.begin_window(to_tick, threshold);
            }
        });

        PvsMetrics::add(&self.metrics.acks_applied, applied.into_inner());
        PvsMetrics::add(&self.metrics.acks_dropped, dropped.into_inner());
    }

    /// Stage 2
    fn refresh_chunks(&mut self, store: &dyn EntityStore) {
        let global = self.config.culling_enabled;
        let range = self.config.view_range;
        {
            let chunks = &self.chunks;
            parallel_for(&mut self.sessions, self.config.parallel_batch_size, |s| {
                if s.culls(global) {
                    gather_visible_chunks(s, store, chunks, range);
                } else {
                    s.viewers.clear();
                    s.chunk_locations.clear();
                }
            });
        }

        for s in &self.sessions {
            for location in &s.chunk_locations {
                self.chunks.queue_update(location);
            }
        }
        let stats = self.chunks.refresh_queued(store, &self.handles);
        PvsMetrics::add(&self.metrics.chunks_rebuilt, stats.rebuilt);
        if !stats.failed.is_empty() {
            warn!("{} chunks failed to rebuild and will be retried", stats.failed.len());
        }

        let chunks = &self.chunks;
        parallel_for(&mut self.sessions, self.config.parallel_batch_size, |s| {
            if s.culls(global) {
                rank_chunks(s, chunks);
            } else {
                s.chunks.clear();
            }
        });

        self.overrides.cache_globals(store, &self.handles);
    }

    /// Stage 3
    fn resolve_sessions(&mut self, store: &dyn EntityStore, to_tick: GameTick) {
        let walk = SessionWalk {
            arena: &self.arena,
            chunks: &self.chunks,
            overrides: &self.overrides,
            store,
            handles: &self.handles,
            budget: EntryBudget {
                new_limit: self.config.new_entity_budget,
                enter_limit: self.config.enter_entity_budget,
            },
            low_lod_distance: self.config.low_lod_distance,
            to_tick,
        };
        let global = self.config.culling_enabled;
        let dirty = &self.dirty;
        let deletions = &self.deletions;
        let handles = &self.handles;

        parallel_for(&mut self.sessions, self.config.parallel_batch_size, |s| {
            if s.culls(global) {
                walk.run(s);
            } else {
                collect_unculled(s, store, dirty, handles, to_tick);
            }
            build_states(s, store);
            deletions.get_deleted(s.from_tick, &mut s.deleted);
        });
    }

    /// Stage 4
    fn serialize(&mut self, store: &dyn EntityStore, to_tick: GameTick) {
        let players = player_states(self.sessions.iter(), store);
        parallel_for(&mut self.sessions, self.config.parallel_batch_size, |s| {
            let state = assemble(s, players_since(&players, s.from_tick), to_tick);
            match encode(&ServerMessage::State(state)) {
                Ok(bytes) => s.payload = Some(bytes),
                Err(e) => error!("Failed to encode state for session {}: {}", s.id, e),
            }
        });
    }

    /// Stage 5
    fn send(&mut self, to_tick: GameTick) {
        for s in &mut self.sessions {
            let Some(payload) = s.payload.take() else {
                continue;
            };
            if let Err(e) = self.transport.send_state(s.id, &payload, s.force_reliable) {
                warn!("Failed to send state {} to session {}: {}", to_tick, s.id, e);
                continue;
            }

            PvsMetrics::add(&self.metrics.bytes_sent, payload.len());
            PvsMetrics::add(&self.metrics.states_sent, s.stats.states);
            PvsMetrics::add(&self.metrics.entities_entered, s.stats.entered);
            PvsMetrics::add(&self.metrics.budget_deferred, s.stats.deferred);
            PvsMetrics::add(&self.metrics.empty_diffs, s.stats.empty_diffs);
            if s.from_tick == 0 {
                PvsMetrics::add(&self.metrics.full_states, 1);
            }
            if s.force_reliable {
                PvsMetrics::add(&self.metrics.reliable_states, 1);
            }

            if self.transport.is_dummy(s.id) {
                s.receive_ack(to_tick);
            }
        }
    }

    /// Stage 6
    fn dispatch_leaves(&mut self, to_tick: GameTick) {
        let global = self.config.culling_enabled;
        let arena = &self.arena;
        parallel_for(&mut self.sessions, self.config.parallel_batch_size, |s| {
            if s.culls(global) {
                s.collect_leaves(to_tick, arena);
            }
        });

        for s in &self.sessions {
            if s.left_view.is_empty() {
                continue;
            }
            let message = ServerMessage::LeavePvs(LeavePvsMessage {
                tick: to_tick,
                entities: s.left_view.clone(),
            });
            let payload = match encode(&message) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to encode leave message for session {}: {}", s.id, e);
                    continue;
                }
            };
            match self.transport.send_leave(s.id, &payload) {
                Ok(()) => PvsMetrics::add(&self.metrics.leave_notices, s.left_view.len()),
                Err(e) => warn!("Failed to send leave message to session {}: {}", s.id, e),
            }
        }
    }

    /// Stage 7
    fn cleanup(&mut self, to_tick: GameTick) {
        let depth = self.config.dirty_buffer_size;
        let pool = &self.list_pool;
        parallel_for(&mut self.sessions, self.config.parallel_batch_size, |s| {
            s.record_sent(to_tick, depth, pool);
        });

        for s in &mut self.sessions {
            for location in s.chunk_retries.drain(..) {
                self.chunks.mark_dirty(&location);
            }
        }

        self.dirty.rotate(to_tick + 1);

        if let Some(due) = self.arena.take_due_returns(to_tick) {
            if self.sessions.len() > PARALLEL_CLEAR_SESSIONS {
                parallel_for(&mut self.sessions, self.config.parallel_batch_size, |s| {
                    clear_entries(&mut s.entity_data, &due);
                });
            } else {
                for s in &mut self.sessions {
                    clear_entries(&mut s.entity_data, &due);
                }
            }
            self.arena.recycle(&due);
            debug!("Recycled {} entity handles", due.len());
        }

        let oldest_ack = self
            .sessions
            .iter()
            .map(|s| s.deletion_floor(to_tick))
            .min()
            .unwrap_or(GameTick::MAX);
        self.deletions.cull(oldest_ack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::RecordingTransport;
    use crate::util::vec2::Vec2;
    use crate::world::memory::InMemoryWorld;
    use uuid::Uuid;

    fn setup(config: PvsConfig) -> (PvsSystem, Arc<RecordingTransport>, InMemoryWorld) {
        let transport = Arc::new(RecordingTransport::new());
        let system = PvsSystem::new(config, transport.clone()).unwrap();
        let world = InMemoryWorld::with_sink(system.sink());
        (system, transport, world)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = PvsConfig {
            view_range: 0.0,
            ..PvsConfig::default()
        };
        let result = PvsSystem::new(config, Arc::new(RecordingTransport::new()));
        assert!(matches!(result, Err(PvsError::InvalidConfig(_))));
    }

    #[test]
    fn test_time_travel_rejected() {
        let (mut system, _, world) = setup(PvsConfig::default());
        system.update(&world, 5).unwrap();
        assert!(matches!(
            system.update(&world, 5),
            Err(PvsError::TimeTravel { current: 5, requested: 5 })
        ));
    }

    #[test]
    fn test_entities_tracked_and_chunked() {
        let (mut system, _, mut world) = setup(PvsConfig::default());
        let map = world.spawn_map();
        let a = world.spawn(map, Vec2::new(1.0, 1.0));
        let nested = world.spawn(a, Vec2::ZERO);
        system.update(&world, 1).unwrap();

        assert_eq!(system.tracked_entities(), 3);
        assert!(system.chunk_index().location_of(a).is_some());
        assert!(system.chunk_index().location_of(nested).is_none());
        assert!(system.chunk_index().location_of(map).is_none());
    }

    #[test]
    fn test_session_storage_grows() {
        let config = PvsConfig {
            session_initial: 1,
            session_growth: 1,
            ..PvsConfig::default()
        };
        let (mut system, _, world) = setup(config);
        let sink = system.sink();
        for i in 0..3 {
            sink.connect(Uuid::new_v4(), format!("p{}", i));
        }
        system.update(&world, 1).unwrap();
        assert_eq!(system.session_count(), 3);
    }

    #[test]
    fn test_disconnect_reindexes() {
        let (mut system, _, world) = setup(PvsConfig::default());
        let sink = system.sink();
        let ids: Vec<_> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            sink.connect(*id, "p");
        }
        system.update(&world, 1).unwrap();
        sink.disconnect(ids[0]);
        system.update(&world, 2).unwrap();

        assert_eq!(system.session_count(), 2);
        assert!(system.last_received_ack(ids[0]).is_none());
        assert!(system.last_received_ack(ids[2]).is_some());
    }

    #[test]
    fn test_arena_growth_resizes_sessions() {
        let config = PvsConfig {
            entity_initial: 2,
            entity_growth: 2,
            ..PvsConfig::default()
        };
        let (mut system, _, mut world) = setup(config);
        let session = Uuid::new_v4();
        system.sink().connect(session, "p");
        let map = world.spawn_map();
        let mut last = map;
        for i in 0..6 {
            last = world.spawn(map, Vec2::new(i as f32, 0.0));
        }
        system.update(&world, 1).unwrap();
        assert!(system.arena_capacity() >= 7);
        assert!(system.session_entry(session, last).is_some());
    }

    #[test]
    fn test_capacity_exhausted_is_fatal() {
        let config = PvsConfig {
            entity_initial: 2,
            entity_growth: 1,
            entity_max: 3,
            ..PvsConfig::default()
        };
        let (mut system, _, mut world) = setup(config);
        let map = world.spawn_map();
        for _ in 0..3 {
            world.spawn(map, Vec2::ZERO);
        }
        assert!(matches!(
            system.update(&world, 1),
            Err(PvsError::CapacityExhausted { max: 3 })
        ));
    }

    #[test]
    fn test_after_entity_flush() {
        let (mut system, _, mut world) = setup(PvsConfig::default());
        let session = Uuid::new_v4();
        system.sink().connect(session, "p");
        let map = world.spawn_map();
        world.spawn(map, Vec2::ZERO);
        system.update(&world, 1).unwrap();
        system.sink().client_ack(session, 1);
        system.update(&world, 2).unwrap();

        assert!(!system.after_entity_flush(&world).unwrap());

        world.delete(map);
        assert!(system.after_entity_flush(&world).unwrap());
        assert_eq!(system.tracked_entities(), 0);

        system.update(&world, 3).unwrap();
        assert_eq!(system.last_received_ack(session), Some(2));
    }

    #[test]
    fn test_initialize_rescans_world() {
        let mut world = InMemoryWorld::new();
        let map = world.spawn_map();
        let a = world.spawn(map, Vec2::new(3.0, 3.0));
        world.spawn(a, Vec2::ZERO);

        let transport = Arc::new(RecordingTransport::new());
        let mut system = PvsSystem::new(PvsConfig::default(), transport).unwrap();
        system.initialize(&world).unwrap();
        assert_eq!(system.tracked_entities(), 3);
        assert!(system.chunk_index().location_of(a).is_some());
    }
}
