use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::component::{ComponentFamily, ComponentState};
use super::snapshot::SnapshotError;
use super::{EntityId, SessionId};

/// Full replicated state of one entity: at most one component state per family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: EntityId,
    components: BTreeMap<ComponentFamily, ComponentState>,
}

impl EntityState {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            components: BTreeMap::new(),
        }
    }

    /// Builder form of [`EntityState::set_component`]
    pub fn with_component(mut self, state: ComponentState) -> Self {
        self.set_component(state);
        self
    }

    /// Insert or replace the state for `state.family()`
    pub fn set_component(&mut self, state: ComponentState) -> Option<ComponentState> {
        self.components.insert(state.family(), state)
    }

    pub fn remove_component(&mut self, family: ComponentFamily) -> Option<ComponentState> {
        self.components.remove(&family)
    }

    pub fn component(&self, family: ComponentFamily) -> Option<&ComponentState> {
        self.components.get(&family)
    }

    /// Component states in family order
    pub fn components(&self) -> impl Iterator<Item = &ComponentState> {
        self.components.values()
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Check a record that came off the wire: every key must match its value's
    /// family and every float must be finite
    pub fn validate(&self) -> Result<(), SnapshotError> {
        for (key, state) in &self.components {
            if *key != state.family() {
                return Err(SnapshotError::FamilyMismatch {
                    entity: self.id,
                    key: *key,
                    found: state.family(),
                });
            }
            if !state.is_finite() {
                return Err(SnapshotError::NonFinite {
                    entity: self.id,
                    family: *key,
                });
            }
        }
        Ok(())
    }
}

/// Connection status of a player session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Connecting,
    InLobby,
    InGame,
    Disconnected,
}

/// Client-visible state of one player session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub session: SessionId,
    pub name: String,
    pub controlled_entity: Option<EntityId>,
    pub status: SessionStatus,
}

impl PlayerState {
    pub fn new(session: SessionId, name: impl Into<String>) -> Self {
        Self {
            session,
            name: name.into(),
            controlled_entity: None,
            status: SessionStatus::Connecting,
        }
    }
}
