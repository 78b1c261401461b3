use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::error::PvsError;
use crate::net::protocol::{decode, ClientMessage};
use crate::world::types::{EntityUid, GameTick, NetEntity, SessionId, VisMask};

/// Changes reported to the replication core.
///
/// Events are queued and applied at the start of the next tick, so no
/// entity or session transition happens while a tick is being processed.
#[derive(Debug, Clone, PartialEq)]
pub enum PvsEvent {
    EntityAdded { uid: EntityUid },
    /// Entity is being torn down. It stays addressable until `EntityDeleted`.
    EntityTerminating { uid: EntityUid },
    /// `parent` is the last parent the entity had
    EntityDeleted { uid: EntityUid, parent: Option<EntityUid> },
    /// Local position changed. `old_parent` is set when the parent changed.
    EntityMoved { uid: EntityUid, old_parent: Option<EntityUid> },
    /// A networked component changed on `tick`
    EntityDirty { uid: EntityUid, tick: GameTick },
    VisibilityChanged { uid: EntityUid, mask: VisMask },

    /// A map or grid was created
    RootAdded { uid: EntityUid },
    /// A map or grid is about to be deleted; its chunks go with it
    RootRemoved { uid: EntityUid },

    SessionConnected { session: SessionId, name: String },
    SessionDisconnected { session: SessionId },
    Attached { session: SessionId, entity: Option<EntityUid> },
    ViewSubscriptionAdded { session: SessionId, entity: EntityUid },
    ViewSubscriptionRemoved { session: SessionId, entity: EntityUid },
    /// Per-session override of the global culling switch
    SessionCulling { session: SessionId, enabled: bool },
    PlayerRenamed { session: SessionId, name: String },

    ClientAck { session: SessionId, tick: GameTick },
    RequestFullState { session: SessionId, tick: GameTick, missing: Option<NetEntity> },

    AddGlobalOverride { uid: EntityUid, recursive: bool },
    RemoveGlobalOverride { uid: EntityUid },
    AddSessionOverride { session: SessionId, uid: EntityUid },
    RemoveSessionOverride { session: SessionId, uid: EntityUid },
    /// `session: None` forces the entity for everyone
    AddForcedOverride { session: Option<SessionId>, uid: EntityUid },
    RemoveForcedOverride { session: Option<SessionId>, uid: EntityUid },
}

/// Producer side of the event queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<PvsEvent>,
}

impl EventSink {
    pub fn new(tx: Sender<PvsEvent>) -> Self {
        Self { tx }
    }

    /// Create a connected sink / receiver pair
    pub fn channel() -> (Self, Receiver<PvsEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    #[inline]
    pub fn send(&self, event: PvsEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("PVS event dropped, receiver gone: {:?}", e.0);
        }
    }

    pub fn client_ack(&self, session: SessionId, tick: GameTick) {
        self.send(PvsEvent::ClientAck { session, tick });
    }

    pub fn connect(&self, session: SessionId, name: impl Into<String>) {
        self.send(PvsEvent::SessionConnected {
            session,
            name: name.into(),
        });
    }

    pub fn disconnect(&self, session: SessionId) {
        self.send(PvsEvent::SessionDisconnected { session });
    }

    pub fn attach(&self, session: SessionId, entity: Option<EntityUid>) {
        self.send(PvsEvent::Attached { session, entity });
    }

    /// Decode a raw client packet and queue the matching event
    pub fn client_packet(&self, session: SessionId, data: &[u8]) -> Result<(), PvsError> {
        match decode::<ClientMessage>(data)? {
            ClientMessage::Ack { tick } => self.client_ack(session, tick),
            ClientMessage::RequestFullState { tick, missing_entity } => self.send(PvsEvent::RequestFullState {
                session,
                tick,
                missing: missing_entity,
            }),
        }
        Ok(())
    }
}
