//! Outbound side of replication.
//!
//! The core hands encoded [`ServerMessage`]s to a [`StateTransport`]; the
//! transport decides how to get them to the client. Compression and actual
//! reliability live behind this trait.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::error::PvsError;
use crate::net::protocol::{decode, GameState, LeavePvsMessage, ServerMessage};
use crate::world::types::SessionId;

pub trait StateTransport: Send + Sync {
    /// Deliver an encoded `ServerMessage::State`
    fn send_state(&self, session: SessionId, payload: &[u8], reliable: bool) -> Result<(), PvsError>;

    /// Deliver an encoded `ServerMessage::LeavePvs`. Must be reliable.
    fn send_leave(&self, session: SessionId, payload: &[u8]) -> Result<(), PvsError>;

    /// Sessions whose channel goes nowhere (bots, replay recorders). Their
    /// states are acknowledged by the server itself right after sending.
    fn is_dummy(&self, _session: SessionId) -> bool {
        false
    }
}

/// Packet queued by [`ChannelTransport`]
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub session: SessionId,
    pub payload: Vec<u8>,
    pub reliable: bool,
}

/// Pushes packets into a crossbeam channel drained by the network task
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: Sender<OutboundPacket>,
}

impl ChannelTransport {
    pub fn new() -> (Self, Receiver<OutboundPacket>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    fn push(&self, session: SessionId, payload: &[u8], reliable: bool) -> Result<(), PvsError> {
        self.tx
            .send(OutboundPacket {
                session,
                payload: payload.to_vec(),
                reliable,
            })
            .map_err(|e| PvsError::Transport(e.to_string()))
    }
}

impl StateTransport for ChannelTransport {
    fn send_state(&self, session: SessionId, payload: &[u8], reliable: bool) -> Result<(), PvsError> {
        self.push(session, payload, reliable)
    }

    fn send_leave(&self, session: SessionId, payload: &[u8]) -> Result<(), PvsError> {
        self.push(session, payload, true)
    }
}

/// Discards everything; every session is a dummy
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl StateTransport for NullTransport {
    fn send_state(&self, _session: SessionId, _payload: &[u8], _reliable: bool) -> Result<(), PvsError> {
        Ok(())
    }

    fn send_leave(&self, _session: SessionId, _payload: &[u8]) -> Result<(), PvsError> {
        Ok(())
    }

    fn is_dummy(&self, _session: SessionId) -> bool {
        true
    }
}

/// A message captured by [`RecordingTransport`]
#[derive(Debug, Clone)]
pub struct Delivery {
    pub session: SessionId,
    pub message: ServerMessage,
    pub reliable: bool,
}

/// Decodes and keeps every message. Used by tests and the benchmark.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    deliveries: Mutex<Vec<Delivery>>,
    dummies: Mutex<FxHashSet<SessionId>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `session` as a dummy channel from now on
    pub fn set_dummy(&self, session: SessionId) {
        self.dummies.lock().insert(session);
    }

    fn record(&self, session: SessionId, payload: &[u8], reliable: bool) -> Result<(), PvsError> {
        let message: ServerMessage = decode(payload)?;
        self.deliveries.lock().push(Delivery {
            session,
            message,
            reliable,
        });
        Ok(())
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn states_for(&self, session: SessionId) -> Vec<GameState> {
        self.deliveries
            .lock()
            .iter()
            .filter(|d| d.session == session)
            .filter_map(|d| match &d.message {
                ServerMessage::State(state) => Some(state.clone()),
                ServerMessage::LeavePvs(_) => None,
            })
            .collect()
    }

    pub fn last_state_for(&self, session: SessionId) -> Option<GameState> {
        self.states_for(session).pop()
    }

    pub fn leaves_for(&self, session: SessionId) -> Vec<LeavePvsMessage> {
        self.deliveries
            .lock()
            .iter()
            .filter(|d| d.session == session)
            .filter_map(|d| match &d.message {
                ServerMessage::LeavePvs(leave) => Some(leave.clone()),
                ServerMessage::State(_) => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.deliveries.lock().clear();
    }
}

impl StateTransport for RecordingTransport {
    fn send_state(&self, session: SessionId, payload: &[u8], reliable: bool) -> Result<(), PvsError> {
        self.record(session, payload, reliable)
    }

    fn send_leave(&self, session: SessionId, payload: &[u8]) -> Result<(), PvsError> {
        self.record(session, payload, true)
    }

    fn is_dummy(&self, session: SessionId) -> bool {
        self.dummies.lock().contains(&session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::encode;
    use crate::world::types::NetEntity;
    use uuid::Uuid;

    #[test]
    fn test_recording_transport_splits_messages() {
        let transport = RecordingTransport::new();
        let session = Uuid::new_v4();

        let state = ServerMessage::State(GameState {
            to_tick: 3,
            ..Default::default()
        });
        let leave = ServerMessage::LeavePvs(LeavePvsMessage {
            tick: 3,
            entities: vec![NetEntity(4)],
        });
        transport.send_state(session, &encode(&state).unwrap(), false).unwrap();
        transport.send_leave(session, &encode(&leave).unwrap()).unwrap();

        assert_eq!(transport.states_for(session).len(), 1);
        assert_eq!(transport.leaves_for(session)[0].entities, vec![NetEntity(4)]);
        assert!(transport.deliveries()[1].reliable);
        assert!(transport.states_for(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn test_recording_transport_rejects_garbage() {
        let transport = RecordingTransport::new();
        assert!(transport.send_state(Uuid::new_v4(), &[0xff; 3], false).is_err());
    }

    #[test]
    fn test_dummy_sessions() {
        let transport = RecordingTransport::new();
        let session = Uuid::new_v4();
        assert!(!transport.is_dummy(session));
        transport.set_dummy(session);
        assert!(transport.is_dummy(session));
        assert!(NullTransport.is_dummy(session));
    }

    #[test]
    fn test_channel_transport() {
        let (transport, rx) = ChannelTransport::new();
        let session = Uuid::new_v4();
        transport.send_leave(session, &[1, 2]).unwrap();
        let packet = rx.try_recv().unwrap();
        assert_eq!(packet.payload, vec![1, 2]);
        assert!(packet.reliable);

        drop(rx);
        assert!(matches!(
            transport.send_state(session, &[1], false),
            Err(PvsError::Transport(_))
        ));
    }
}
