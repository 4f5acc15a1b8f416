//! Live object registry the reconciler converges
//!
//! The game owns its live entities and players; the reconciler only reaches
//! them through [`EntityRegistry`]. [`LiveWorld`] is a plain in-memory
//! registry used by the soak binary and the tests.

use rustc_hash::FxHashMap;

use crate::state::{
    ComponentState, EntityId, EntityState, PlayerState, SessionId, SessionStatus, StateSnapshot,
};
use crate::util::vec2::Vec2;

/// Live entity/player objects, mutated only by convergence
pub trait EntityRegistry {
    fn create_entity(&mut self, id: EntityId);
    fn destroy_entity(&mut self, id: EntityId) -> bool;
    fn contains_entity(&self, id: EntityId) -> bool;
    /// Bring a live entity in line with its replicated record
    fn apply_state_to_entity(&mut self, id: EntityId, state: &EntityState);
    /// Create or update a player's session view
    fn apply_state_to_player(&mut self, id: SessionId, state: &PlayerState);
    fn retire_player(&mut self, id: SessionId) -> bool;
    fn entity_ids(&self) -> Vec<EntityId>;
    fn player_ids(&self) -> Vec<SessionId>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveSprite {
    pub visible: bool,
    pub draw_depth: i32,
    pub sprite_key: String,
    pub base_name: String,
}

/// Client-side view of one entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveEntity {
    pub position: Option<Vec2>,
    pub rotation: f32,
    pub velocity: Option<Vec2>,
    pub mass: Option<f32>,
    pub sprite: Option<LiveSprite>,
}

impl LiveEntity {
    pub fn from_state(state: &EntityState) -> Self {
        let mut entity = Self::default();
        entity.apply(state);
        entity
    }

    /// Replace all replicated fields with the record's. Families missing from
    /// the record are cleared.
    pub fn apply(&mut self, state: &EntityState) {
        *self = Self::default();
        for component in state.components() {
            match component {
                ComponentState::Transform { position, rotation } => {
                    self.position = Some(*position);
                    self.rotation = *rotation;
                }
                ComponentState::Velocity { velocity } => {
                    self.velocity = Some(*velocity);
                }
                ComponentState::Physics { mass } => {
                    self.mass = Some(*mass);
                }
                ComponentState::Sprite {
                    visible,
                    draw_depth,
                    sprite_key,
                    base_name,
                } => {
                    self.sprite = Some(LiveSprite {
                        visible: *visible,
                        draw_depth: *draw_depth,
                        sprite_key: sprite_key.clone(),
                        base_name: base_name.clone(),
                    });
                }
            }
        }
    }
}

/// Client-side view of one player session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePlayer {
    pub name: String,
    pub controlled_entity: Option<EntityId>,
    pub status: SessionStatus,
}

impl From<&PlayerState> for LivePlayer {
    fn from(state: &PlayerState) -> Self {
        Self {
            name: state.name.clone(),
            controlled_entity: state.controlled_entity,
            status: state.status,
        }
    }
}

#[derive(Debug, Default)]
pub struct LiveWorld {
    entities: FxHashMap<EntityId, LiveEntity>,
    players: FxHashMap<SessionId, LivePlayer>,
    entities_created: u64,
    entities_destroyed: u64,
}

impl LiveWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, id: EntityId) -> Option<&LiveEntity> {
        self.entities.get(&id)
    }

    pub fn player(&self, id: SessionId) -> Option<&LivePlayer> {
        self.players.get(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn entities_created(&self) -> u64 {
        self.entities_created
    }

    pub fn entities_destroyed(&self) -> u64 {
        self.entities_destroyed
    }

    /// Whether the live objects show exactly what `snapshot` describes
    pub fn matches(&self, snapshot: &StateSnapshot) -> bool {
        self.entities.len() == snapshot.entity_count()
            && self.players.len() == snapshot.player_count()
            && snapshot.entities().iter().all(|(id, state)| {
                self.entities.get(id) == Some(&LiveEntity::from_state(state))
            })
            && snapshot
                .players()
                .iter()
                .all(|(id, state)| self.players.get(id) == Some(&LivePlayer::from(state)))
    }
}

impl EntityRegistry for LiveWorld {
    fn create_entity(&mut self, id: EntityId) {
        if !self.entities.contains_key(&id) {
            self.entities.insert(id, LiveEntity::default());
            self.entities_created += 1;
        }
    }

    fn destroy_entity(&mut self, id: EntityId) -> bool {
        let removed = self.entities.remove(&id).is_some();
        if removed {
            self.entities_destroyed += 1;
        }
        removed
    }

    fn contains_entity(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    fn apply_state_to_entity(&mut self, id: EntityId, state: &EntityState) {
        self.entities.entry(id).or_default().apply(state);
    }

    fn apply_state_to_player(&mut self, id: SessionId, state: &PlayerState) {
        self.players.insert(id, LivePlayer::from(state));
    }

    fn retire_player(&mut self, id: SessionId) -> bool {
        self.players.remove(&id).is_some()
    }

    fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    fn player_ids(&self) -> Vec<SessionId> {
        self.players.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> EntityState {
        EntityState::new(4)
            .with_component(ComponentState::transform(Vec2::new(1.0, 2.0), 0.5))
            .with_component(ComponentState::Physics { mass: 12.0 })
            .with_component(ComponentState::sprite(true, 3, "door"))
    }

    #[test]
    fn test_apply_sets_every_family() {
        let live = LiveEntity::from_state(&record());
        assert_eq!(live.position, Some(Vec2::new(1.0, 2.0)));
        assert_eq!(live.rotation, 0.5);
        assert_eq!(live.mass, Some(12.0));
        assert_eq!(live.velocity, None);
        assert_eq!(live.sprite.as_ref().map(|s| s.draw_depth), Some(3));
    }

    #[test]
    fn test_apply_clears_missing_families() {
        let mut live = LiveEntity::from_state(&record());
        live.apply(&EntityState::new(4).with_component(ComponentState::velocity(Vec2::new(1.0, 0.0))));

        assert_eq!(live.position, None);
        assert_eq!(live.sprite, None);
        assert_eq!(live.velocity, Some(Vec2::new(1.0, 0.0)));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut world = LiveWorld::new();
        world.create_entity(4);
        world.apply_state_to_entity(4, &record());
        let once = world.entity(4).cloned();
        world.apply_state_to_entity(4, &record());

        assert_eq!(world.entity(4).cloned(), once);
        assert_eq!(world.entities_created(), 1);
    }

    #[test]
    fn test_create_and_destroy() {
        let mut world = LiveWorld::new();
        world.create_entity(1);
        world.create_entity(1);
        assert_eq!(world.entity_count(), 1);
        assert!(world.contains_entity(1));

        assert!(world.destroy_entity(1));
        assert!(!world.destroy_entity(1));
        assert_eq!(world.entities_destroyed(), 1);
        assert!(world.entity_ids().is_empty());
    }

    #[test]
    fn test_players() {
        let mut world = LiveWorld::new();
        let mut state = PlayerState::new(2, "Alice");
        world.apply_state_to_player(2, &state);
        state.status = SessionStatus::InGame;
        world.apply_state_to_player(2, &state);

        assert_eq!(world.player_count(), 1);
        assert_eq!(world.player(2).map(|p| p.status), Some(SessionStatus::InGame));
        assert!(world.retire_player(2));
        assert!(!world.retire_player(2));
    }

    #[test]
    fn test_matches_snapshot() {
        let snapshot = StateSnapshot::from_records(
            1,
            0.0,
            vec![record()],
            vec![PlayerState::new(1, "Bob")],
        )
        .unwrap();

        let mut world = LiveWorld::new();
        assert!(!world.matches(&snapshot));

        world.create_entity(4);
        world.apply_state_to_entity(4, &record());
        world.apply_state_to_player(1, &PlayerState::new(1, "Bob"));
        assert!(world.matches(&snapshot));

        world.create_entity(9);
        assert!(!world.matches(&snapshot));
    }
}
