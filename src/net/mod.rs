//! Snapshot/delta synchronization: wire protocol, server publishing and
//! client reconciliation.

pub mod ack;
pub mod client;
pub mod compiler;
pub mod framing;
pub mod loopback;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod server;
pub mod window;
