//! Replicated game state: component records, snapshots, deltas and the
//! server-side authoritative world they are captured from.

pub mod component;
pub mod delta;
pub mod record;
pub mod snapshot;
pub mod world;

/// Server-assigned snapshot sequence number (strictly increasing)
pub type Sequence = u32;
/// Stable entity identity shared by server and clients
pub type EntityId = u32;
/// Player / session identity
pub type SessionId = u32;

pub use component::{ComponentFamily, ComponentState};
pub use delta::{DeltaError, StateDelta, Tombstone};
pub use record::{EntityState, PlayerState, SessionStatus};
pub use snapshot::{SnapshotError, StateSnapshot};
pub use world::AuthoritativeWorld;
