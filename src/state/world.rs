//! Server-owned authoritative entity state
//!
//! The server mutates this freely between ticks, then captures an immutable
//! [`StateSnapshot`] of it once per tick.

use std::collections::BTreeMap;

use tracing::warn;

use super::component::{ComponentFamily, ComponentState};
use super::record::{EntityState, PlayerState, SessionStatus};
use super::snapshot::StateSnapshot;
use super::{EntityId, Sequence, SessionId};

/// Velocities below this are treated as at rest
const REST_SPEED: f32 = 0.001;

/// Fraction of velocity lost per second of simulation
const DRAG_PER_SECOND: f32 = 0.01;

#[derive(Debug, Default)]
pub struct AuthoritativeWorld {
    entities: BTreeMap<EntityId, EntityState>,
    players: BTreeMap<SessionId, PlayerState>,
    next_entity_id: EntityId,
    next_session_id: SessionId,
}

impl AuthoritativeWorld {
    pub fn new() -> Self {
        Self {
            next_entity_id: 1,
            next_session_id: 1,
            ..Default::default()
        }
    }

    /// Spawn an entity with the given components and return its id.
    /// Non-finite component states are left out.
    pub fn spawn(&mut self, components: impl IntoIterator<Item = ComponentState>) -> EntityId {
        let id = self.next_entity_id;
        self.next_entity_id += 1;

        let mut entity = EntityState::new(id);
        for component in components {
            if !component.is_finite() {
                warn!(entity = id, ?component, "Rejected non-finite component state");
                continue;
            }
            entity.set_component(component);
        }
        self.entities.insert(id, entity);
        id
    }

    /// Remove an entity. Players controlling it lose control.
    pub fn despawn(&mut self, id: EntityId) -> bool {
        if self.entities.remove(&id).is_none() {
            return false;
        }
        for player in self.players.values_mut() {
            if player.controlled_entity == Some(id) {
                player.controlled_entity = None;
            }
        }
        true
    }

    /// Insert or replace one component state; false if the entity does not
    /// exist or the state is not finite
    pub fn set_component(&mut self, id: EntityId, state: ComponentState) -> bool {
        if !state.is_finite() {
            warn!(entity = id, ?state, "Rejected non-finite component state");
            return false;
        }
        match self.entities.get_mut(&id) {
            Some(entity) => {
                entity.set_component(state);
                true
            }
            None => false,
        }
    }

    pub fn remove_component(&mut self, id: EntityId, family: ComponentFamily) -> bool {
        self.entities
            .get_mut(&id)
            .and_then(|entity| entity.remove_component(family))
            .is_some()
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityState> {
        self.entities.get(&id)
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Register a new player session and return its id
    pub fn connect_player(&mut self, name: impl Into<String>) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.players.insert(id, PlayerState::new(id, name));
        id
    }

    pub fn set_player_status(&mut self, id: SessionId, status: SessionStatus) -> bool {
        match self.players.get_mut(&id) {
            Some(player) => {
                player.status = status;
                true
            }
            None => false,
        }
    }

    /// Attach a player to an entity (or detach with `None`).
    /// Fails if the player or the target entity does not exist.
    pub fn set_controlled_entity(&mut self, id: SessionId, entity: Option<EntityId>) -> bool {
        if let Some(entity_id) = entity {
            if !self.entities.contains_key(&entity_id) {
                return false;
            }
        }
        match self.players.get_mut(&id) {
            Some(player) => {
                player.controlled_entity = entity;
                true
            }
            None => false,
        }
    }

    pub fn disconnect_player(&mut self, id: SessionId) -> bool {
        self.players.remove(&id).is_some()
    }

    pub fn player(&self, id: SessionId) -> Option<&PlayerState> {
        self.players.get(&id)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Advance physics by `dt` seconds: every entity with transform, velocity
    /// and physics state drifts along its velocity with a little drag.
    pub fn integrate(&mut self, dt: f32) {
        for entity in self.entities.values_mut() {
            if entity.component(ComponentFamily::Physics).is_none() {
                continue;
            }
            let velocity = match entity.component(ComponentFamily::Velocity) {
                Some(ComponentState::Velocity { velocity }) => *velocity,
                _ => continue,
            };
            let (mut position, rotation) = match entity.component(ComponentFamily::Transform) {
                Some(ComponentState::Transform { position, rotation }) => (*position, *rotation),
                _ => continue,
            };
            if velocity.length() < REST_SPEED {
                continue;
            }

            let velocity = velocity - velocity * (dt * DRAG_PER_SECOND);
            position += velocity * dt;
            if !velocity.is_finite() || !position.is_finite() {
                continue;
            }
            entity.set_component(ComponentState::velocity(velocity));
            entity.set_component(ComponentState::transform(position, rotation));
        }
    }

    /// Capture the current state as an immutable snapshot
    pub fn capture(&self, sequence: Sequence, game_time: f64) -> StateSnapshot {
        StateSnapshot::from_parts(
            sequence,
            game_time,
            self.entities.clone(),
            self.players.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::vec2::Vec2;

    fn mover(velocity: Vec2) -> Vec<ComponentState> {
        vec![
            ComponentState::transform(Vec2::ZERO, 0.0),
            ComponentState::velocity(velocity),
            ComponentState::Physics { mass: 10.0 },
        ]
    }

    fn position_of(world: &AuthoritativeWorld, id: EntityId) -> Vec2 {
        match world.entity(id).and_then(|e| e.component(ComponentFamily::Transform)) {
            Some(ComponentState::Transform { position, .. }) => *position,
            other => panic!("No transform: {:?}", other),
        }
    }

    #[test]
    fn test_spawn_assigns_unique_ids() {
        let mut world = AuthoritativeWorld::new();
        let a = world.spawn(vec![]);
        let b = world.spawn(vec![]);
        assert_ne!(a, b);
        assert_eq!(world.entity_count(), 2);
    }

    #[test]
    fn test_despawn_releases_control() {
        let mut world = AuthoritativeWorld::new();
        let entity = world.spawn(mover(Vec2::ZERO));
        let player = world.connect_player("Alice");
        assert!(world.set_controlled_entity(player, Some(entity)));

        assert!(world.despawn(entity));
        assert!(!world.despawn(entity));
        assert_eq!(world.player(player).unwrap().controlled_entity, None);
    }

    #[test]
    fn test_cannot_control_missing_entity() {
        let mut world = AuthoritativeWorld::new();
        let player = world.connect_player("Bob");
        assert!(!world.set_controlled_entity(player, Some(42)));
        assert!(!world.set_controlled_entity(99, None));
    }

    #[test]
    fn test_integrate_moves_physics_entities() {
        let mut world = AuthoritativeWorld::new();
        let moving = world.spawn(mover(Vec2::new(10.0, 0.0)));
        let resting = world.spawn(mover(Vec2::ZERO));

        world.integrate(0.1);

        assert!(position_of(&world, moving).x > 0.9);
        assert_eq!(position_of(&world, resting), Vec2::ZERO);
    }

    #[test]
    fn test_integrate_skips_entities_without_physics() {
        let mut world = AuthoritativeWorld::new();
        let id = world.spawn(vec![
            ComponentState::transform(Vec2::ZERO, 0.0),
            ComponentState::velocity(Vec2::new(5.0, 5.0)),
        ]);

        world.integrate(1.0);
        assert_eq!(position_of(&world, id), Vec2::ZERO);
    }

    #[test]
    fn test_capture_is_independent_of_later_mutation() {
        let mut world = AuthoritativeWorld::new();
        let id = world.spawn(mover(Vec2::new(1.0, 0.0)));
        let player = world.connect_player("Carol");

        let snapshot = world.capture(1, 0.0);
        world.integrate(1.0);
        world.set_player_status(player, SessionStatus::InGame);
        world.despawn(id);

        assert_eq!(snapshot.sequence(), 1);
        assert!(snapshot.entity(id).is_some());
        assert_eq!(snapshot.player(player).unwrap().status, SessionStatus::Connecting);
    }

    #[test]
    fn test_remove_component() {
        let mut world = AuthoritativeWorld::new();
        let id = world.spawn(mover(Vec2::ZERO));
        assert!(world.remove_component(id, ComponentFamily::Physics));
        assert!(!world.remove_component(id, ComponentFamily::Physics));
        assert!(!world.set_component(99, ComponentState::Physics { mass: 1.0 }));
    }

    #[test]
    fn test_non_finite_states_rejected() {
        let mut world = AuthoritativeWorld::new();
        let id = world.spawn(vec![
            ComponentState::transform(Vec2::ZERO, 0.0),
            ComponentState::Physics { mass: f32::NAN },
        ]);

        let entity = world.entity(id).unwrap();
        assert!(entity.component(ComponentFamily::Physics).is_none());
        assert!(entity.validate().is_ok());

        assert!(!world.set_component(id, ComponentState::velocity(Vec2::new(f32::INFINITY, 0.0))));
        assert!(world.entity(id).unwrap().component(ComponentFamily::Velocity).is_none());
        assert!(world.set_component(id, ComponentState::velocity(Vec2::new(1.0, 0.0))));
    }

    #[test]
    fn test_integrate_keeps_state_finite() {
        let mut world = AuthoritativeWorld::new();
        let id = world.spawn(mover(Vec2::new(f32::MAX, 0.0)));

        world.integrate(10.0);

        let entity = world.entity(id).unwrap();
        assert!(entity.components().all(|c| c.is_finite()));
        assert!(world.capture(1, 0.0).same_state(&world.capture(1, 0.0)));
    }
}
