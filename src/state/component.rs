use serde::{Deserialize, Serialize};

use crate::util::vec2::Vec2;

/// Component families that carry replicated state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ComponentFamily {
    Transform,
    Velocity,
    Physics,
    Renderable,
}

impl ComponentFamily {
    pub const ALL: [ComponentFamily; 4] = [
        ComponentFamily::Transform,
        ComponentFamily::Velocity,
        ComponentFamily::Physics,
        ComponentFamily::Renderable,
    ];
}

/// Replicated state of a single component.
///
/// One variant per known field shape. Anything applying a state to a live
/// object matches on this exhaustively, so adding a family is a compile error
/// everywhere it is not handled yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComponentState {
    Transform { position: Vec2, rotation: f32 },
    Velocity { velocity: Vec2 },
    Physics { mass: f32 },
    Sprite {
        visible: bool,
        draw_depth: i32,
        sprite_key: String,
        base_name: String,
    },
}

impl ComponentState {
    /// Family this state belongs to (and is keyed by inside an entity record)
    pub fn family(&self) -> ComponentFamily {
        match self {
            ComponentState::Transform { .. } => ComponentFamily::Transform,
            ComponentState::Velocity { .. } => ComponentFamily::Velocity,
            ComponentState::Physics { .. } => ComponentFamily::Physics,
            ComponentState::Sprite { .. } => ComponentFamily::Renderable,
        }
    }

    /// No NaN or infinite field. Only finite states compare equal to
    /// themselves, so nothing else may enter a snapshot.
    pub fn is_finite(&self) -> bool {
        match self {
            ComponentState::Transform { position, rotation } => {
                position.is_finite() && rotation.is_finite()
            }
            ComponentState::Velocity { velocity } => velocity.is_finite(),
            ComponentState::Physics { mass } => mass.is_finite(),
            ComponentState::Sprite { .. } => true,
        }
    }

    pub fn transform(position: Vec2, rotation: f32) -> Self {
        ComponentState::Transform { position, rotation }
    }

    pub fn velocity(velocity: Vec2) -> Self {
        ComponentState::Velocity { velocity }
    }

    pub fn sprite(visible: bool, draw_depth: i32, sprite_key: impl Into<String>) -> Self {
        let sprite_key = sprite_key.into();
        ComponentState::Sprite {
            visible,
            draw_depth,
            base_name: sprite_key.clone(),
            sprite_key,
        }
    }
}
