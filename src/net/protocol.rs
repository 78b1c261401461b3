use serde::{Deserialize, Serialize};

use crate::world::types::{GameTick, NetEntity, SessionId};

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Acknowledge receiving the game state for `tick`
    Ack { tick: GameTick },
    /// Ask for a complete resync, optionally naming the entity found missing
    RequestFullState {
        tick: GameTick,
        missing_entity: Option<NetEntity>,
    },
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Per-tick delta snapshot
    State(GameState),
    /// Entities that left view. Always sent reliably.
    LeavePvs(LeavePvsMessage),
}

/// One component's contribution to an entity delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentChange {
    pub component_id: u16,
    /// Serialized component state, `None` when only the tick changed
    pub state: Option<Vec<u8>>,
    pub last_modified: GameTick,
}

/// Changes to one entity since the snapshot's reference tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub net_id: NetEntity,
    pub changes: Vec<ComponentChange>,
    pub last_modified: GameTick,
    /// Complete component list, only present when a component was removed
    /// since the reference tick
    pub present_components: Option<Vec<u16>>,
}

impl EntityState {
    /// True when this delta carries nothing for the client
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.present_components.is_none()
    }
}

/// Replicated per-player info (name, attached entity)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub session: SessionId,
    pub name: String,
    pub attached: Option<NetEntity>,
    pub last_modified: GameTick,
}

/// Snapshot sent to one session on one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    /// Tick the deltas are relative to. 0 means a complete state.
    pub from_tick: GameTick,
    pub to_tick: GameTick,
    pub entity_states: Vec<EntityState>,
    pub player_states: Vec<PlayerState>,
    pub deleted_entities: Vec<NetEntity>,
    /// The transport must deliver this snapshot reliably
    pub force_send_reliably: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeavePvsMessage {
    pub tick: GameTick,
    pub entities: Vec<NetEntity>,
}

/// Encode a message using bincode
/// Uses legacy config for fixed-size integers
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message using bincode
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_state() -> GameState {
        GameState {
            from_tick: 10,
            to_tick: 12,
            entity_states: vec![EntityState {
                net_id: NetEntity(5),
                changes: vec![ComponentChange {
                    component_id: 3,
                    state: Some(vec![1, 2, 3]),
                    last_modified: 11,
                }],
                last_modified: 11,
                present_components: Some(vec![0, 3]),
            }],
            player_states: vec![PlayerState {
                session: Uuid::new_v4(),
                name: "alice".to_string(),
                attached: Some(NetEntity(5)),
                last_modified: 2,
            }],
            deleted_entities: vec![NetEntity(9)],
            force_send_reliably: true,
        }
    }

    #[test]
    fn test_state_survives_codec() {
        let msg = ServerMessage::State(sample_state());
        let bytes = encode(&msg).unwrap();
        let decoded: ServerMessage = decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_client_messages_decode() {
        let msg = ClientMessage::RequestFullState {
            tick: 40,
            missing_entity: Some(NetEntity(77)),
        };
        let decoded: ClientMessage = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_garbage() {
        let result: Result<ServerMessage, _> = decode(&[0xff, 0xff, 0xff, 0xff, 0x01]);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_entity_state() {
        let mut state = EntityState {
            net_id: NetEntity(1),
            changes: Vec::new(),
            last_modified: 3,
            present_components: None,
        };
        assert!(state.is_empty());
        state.present_components = Some(vec![]);
        assert!(!state.is_empty());
    }
}
