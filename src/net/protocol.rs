use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::state::{EntityState, PlayerState, Sequence, SnapshotError, StateDelta, StateSnapshot};

/// Largest reliable message (a full state for a large map)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
/// Largest unreliable message (one UDP payload)
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Snapshot `sequence` was applied and can serve as a delta base
    StateAck { sequence: Sequence },
    /// Local history is inconsistent; send a full state
    RequestFullState,
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Complete state (join or forced resync); send reliably
    FullState(FullState),
    /// Changes relative to a snapshot the client acknowledged; may be lost
    StateDelta(StateDelta),
}

impl ServerMessage {
    /// Sequence of the snapshot this message produces
    pub fn sequence(&self) -> Sequence {
        match self {
            ServerMessage::FullState(full) => full.sequence,
            ServerMessage::StateDelta(delta) => delta.to,
        }
    }
}

/// Full snapshot transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullState {
    pub sequence: Sequence,
    /// Server game time at capture, in seconds
    pub time: f64,
    pub entities: Vec<EntityState>,
    pub players: Vec<PlayerState>,
}

impl FullState {
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        Self {
            sequence: snapshot.sequence(),
            time: snapshot.game_time(),
            entities: snapshot.entities().values().cloned().collect(),
            players: snapshot.players().values().cloned().collect(),
        }
    }

    /// Rebuild the snapshot, stamped with the receiver's `game_time`
    pub fn into_snapshot(self, game_time: f64) -> Result<StateSnapshot, SnapshotError> {
        StateSnapshot::from_records(self.sequence, game_time, self.entities, self.players)
    }
}

/// Encode a message using bincode
/// Uses legacy config for fixed-size integers
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message of at most [`MAX_MESSAGE_SIZE`] bytes
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, DecodeError> {
    decode_bounded::<T, MAX_MESSAGE_SIZE>(data)
}

/// Decode a message using bincode (legacy config for fixed-size integers).
///
/// Length fields are checked against `LIMIT` before anything is allocated,
/// so a corrupt length cannot claim more memory than the limit.
pub fn decode_bounded<T: DeserializeOwned, const LIMIT: usize>(data: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy().with_limit::<LIMIT>())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);
