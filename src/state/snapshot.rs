//! Immutable per-tick state snapshots
//!
//! A snapshot is built once and never changed afterwards. Every transition
//! (a new server tick, a delta applied on the client) produces a new value.

use std::collections::BTreeMap;

use serde::Serialize;

use super::component::ComponentFamily;
use super::record::{EntityState, PlayerState};
use super::{EntityId, Sequence, SessionId};

/// Errors for records that cannot form a valid snapshot
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("Duplicate entity record {0}")]
    DuplicateEntity(EntityId),
    #[error("Duplicate player record {0}")]
    DuplicatePlayer(SessionId),
    #[error("Entity {entity}: component keyed {key:?} carries {found:?} state")]
    FamilyMismatch {
        entity: EntityId,
        key: ComponentFamily,
        found: ComponentFamily,
    },
    #[error("Entity {entity}: {family:?} state is not finite")]
    NonFinite {
        entity: EntityId,
        family: ComponentFamily,
    },
}

/// Full observable state of all entities and players at one server tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    sequence: Sequence,
    game_time: f64,
    entities: BTreeMap<EntityId, EntityState>,
    players: BTreeMap<SessionId, PlayerState>,
}

impl StateSnapshot {
    pub fn empty(sequence: Sequence, game_time: f64) -> Self {
        Self {
            sequence,
            game_time,
            entities: BTreeMap::new(),
            players: BTreeMap::new(),
        }
    }

    /// Build a snapshot from record lists, rejecting duplicate identities and
    /// malformed entity records
    pub fn from_records(
        sequence: Sequence,
        game_time: f64,
        entities: impl IntoIterator<Item = EntityState>,
        players: impl IntoIterator<Item = PlayerState>,
    ) -> Result<Self, SnapshotError> {
        let mut entity_map = BTreeMap::new();
        for entity in entities {
            entity.validate()?;
            let id = entity.id;
            if entity_map.insert(id, entity).is_some() {
                return Err(SnapshotError::DuplicateEntity(id));
            }
        }

        let mut player_map = BTreeMap::new();
        for player in players {
            let id = player.session;
            if player_map.insert(id, player).is_some() {
                return Err(SnapshotError::DuplicatePlayer(id));
            }
        }

        Ok(Self::from_parts(sequence, game_time, entity_map, player_map))
    }

    /// Assemble from maps whose keys are already known to match their records
    pub(crate) fn from_parts(
        sequence: Sequence,
        game_time: f64,
        entities: BTreeMap<EntityId, EntityState>,
        players: BTreeMap<SessionId, PlayerState>,
    ) -> Self {
        Self {
            sequence,
            game_time,
            entities,
            players,
        }
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Game time at capture (server) or reconstruction (client), in seconds
    pub fn game_time(&self) -> f64 {
        self.game_time
    }

    pub fn entities(&self) -> &BTreeMap<EntityId, EntityState> {
        &self.entities
    }

    pub fn players(&self) -> &BTreeMap<SessionId, PlayerState> {
        &self.players
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityState> {
        self.entities.get(&id)
    }

    pub fn player(&self, id: SessionId) -> Option<&PlayerState> {
        self.players.get(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Same sequence and same records. Capture time is ignored: two clients
    /// (or two deliveries) reconstruct the same state at different local times.
    pub fn same_state(&self, other: &StateSnapshot) -> bool {
        self.sequence == other.sequence
            && self.entities == other.entities
            && self.players == other.players
    }
}
