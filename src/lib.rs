//! snapsync
//!
//! Snapshot/delta state synchronization for real-time multiplayer games.
//! The server captures its authoritative world into an immutable snapshot
//! every tick and sends each client either a full state or a delta against
//! the last snapshot that client acknowledged. Clients rebuild snapshots
//! from deltas against a rolling window and converge their live objects.

pub mod config;
pub mod metrics;
pub mod net;
pub mod state;
pub mod util;
