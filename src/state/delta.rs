//! Compact diffs between two snapshots
//!
//! A delta carries only the records that changed between `from` and `to`.
//! Omission means "unchanged", so removal is an explicit [`Tombstone`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::record::{EntityState, PlayerState};
use super::snapshot::{SnapshotError, StateSnapshot};
use super::{EntityId, Sequence, SessionId};

/// Explicit removal marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tombstone {
    Entity(EntityId),
    Player(SessionId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("Invalid delta range {from} -> {to}")]
    InvalidRange { from: Sequence, to: Sequence },
    #[error("Delta expects base {expected}, got {found}")]
    BaseMismatch { expected: Sequence, found: Sequence },
    #[error("Malformed record: {0}")]
    Record(#[from] SnapshotError),
    #[error("{0:?} is both updated and removed")]
    UpdatedAndRemoved(Tombstone),
}

/// Diff from snapshot `from` to snapshot `to`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub from: Sequence,
    pub to: Sequence,
    /// Entity records that changed or were added (whole record replaces base)
    pub entities: Vec<EntityState>,
    /// Player records that changed or were added
    pub players: Vec<PlayerState>,
    pub tombstones: Vec<Tombstone>,
}

impl StateDelta {
    pub fn new(from: Sequence, to: Sequence) -> Self {
        Self {
            from,
            to,
            entities: Vec::new(),
            players: Vec::new(),
            tombstones: Vec::new(),
        }
    }

    /// Number of records carried (updates plus tombstones)
    pub fn record_count(&self) -> usize {
        self.entities.len() + self.players.len() + self.tombstones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    /// Structural checks for a delta received from the network
    pub fn validate(&self) -> Result<(), DeltaError> {
        if self.to <= self.from {
            return Err(DeltaError::InvalidRange {
                from: self.from,
                to: self.to,
            });
        }

        let mut entity_ids = BTreeSet::new();
        for entity in &self.entities {
            entity.validate()?;
            if !entity_ids.insert(entity.id) {
                return Err(SnapshotError::DuplicateEntity(entity.id).into());
            }
        }

        let mut player_ids = BTreeSet::new();
        for player in &self.players {
            if !player_ids.insert(player.session) {
                return Err(SnapshotError::DuplicatePlayer(player.session).into());
            }
        }

        for tombstone in &self.tombstones {
            let updated = match tombstone {
                Tombstone::Entity(id) => entity_ids.contains(id),
                Tombstone::Player(id) => player_ids.contains(id),
            };
            if updated {
                return Err(DeltaError::UpdatedAndRemoved(*tombstone));
            }
        }

        Ok(())
    }

    /// Produce the snapshot at `to` from the snapshot at `from`.
    ///
    /// Only defined for the exact base the delta was computed against.
    /// The base is left untouched; the result is stamped with `game_time`.
    pub fn apply(&self, base: &StateSnapshot, game_time: f64) -> Result<StateSnapshot, DeltaError> {
        if base.sequence() != self.from {
            return Err(DeltaError::BaseMismatch {
                expected: self.from,
                found: base.sequence(),
            });
        }
        self.validate()?;

        let mut entities = base.entities().clone();
        let mut players = base.players().clone();

        for entity in &self.entities {
            entities.insert(entity.id, entity.clone());
        }
        for player in &self.players {
            players.insert(player.session, player.clone());
        }
        for tombstone in &self.tombstones {
            // Removing something the base never had is a no-op
            match tombstone {
                Tombstone::Entity(id) => {
                    entities.remove(id);
                }
                Tombstone::Player(id) => {
                    players.remove(id);
                }
            }
        }

        Ok(StateSnapshot::from_parts(self.to, game_time, entities, players))
    }
}
