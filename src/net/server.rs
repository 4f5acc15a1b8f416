//! Server-side publishing
//!
//! Each tick the server captures the authoritative world into a new
//! snapshot and decides, per client, between a full state, a delta against
//! the client's last ack, or nothing.

use std::sync::Arc;

use hashbrown::HashMap;
use rayon::prelude::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::net::ack::{
    AckBuffer, AckOutcome, AckSubmitter, AckTracker, ClientId, ResyncPolicy, SendPlan,
};
use crate::net::compiler::{DeltaCompiler, DeltaOutcome, HistoryError};
use crate::net::protocol::{ClientMessage, FullState, ServerMessage};
use crate::state::{AuthoritativeWorld, Sequence, StateSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub history_capacity: usize,
    pub ack_buffer_capacity: usize,
    pub policy: ResyncPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            history_capacity: 32,
            ack_buffer_capacity: 4096,
            policy: ResyncPolicy::default(),
        }
    }
}

/// How the transport must carry a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Reliable and ordered (full states)
    Reliable,
    /// May be lost or reordered (deltas)
    Unreliable,
}

/// One message for one client
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub client: ClientId,
    pub message: ServerMessage,
    pub delivery: Delivery,
}

pub struct SyncServer {
    clients: HashMap<ClientId, AckTracker>,
    compiler: DeltaCompiler,
    policy: ResyncPolicy,
    next_sequence: Sequence,
    acks: AckBuffer,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            clients: HashMap::new(),
            compiler: DeltaCompiler::new(config.history_capacity),
            policy: config.policy,
            next_sequence: 1,
            acks: AckBuffer::new(config.ack_buffer_capacity),
        }
    }

    pub fn add_client(&mut self) -> ClientId {
        let id = Uuid::new_v4();
        self.clients.insert(id, AckTracker::new());
        info!(client = %id, "Client added");
        id
    }

    pub fn remove_client(&mut self, client: ClientId) -> bool {
        let removed = self.clients.remove(&client).is_some();
        if removed {
            info!(client = %client, "Client removed");
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn tracker(&self, client: ClientId) -> Option<&AckTracker> {
        self.clients.get(&client)
    }

    /// Handle for connection tasks to queue client messages
    pub fn ack_submitter(&self) -> AckSubmitter {
        self.acks.submitter()
    }

    /// Send `client` a full state on the next publish
    pub fn request_full_state(&mut self, client: ClientId) -> bool {
        match self.clients.get_mut(&client) {
            Some(tracker) => {
                tracker.request_full();
                true
            }
            None => false,
        }
    }

    pub fn handle_ack(&mut self, client: ClientId, sequence: Sequence) -> Option<AckOutcome> {
        let tracker = self.clients.get_mut(&client)?;
        let outcome = tracker.record_ack(sequence);
        if outcome == AckOutcome::Unknown {
            warn!(client = %client, sequence, "Ack for a sequence never sent");
        }
        Some(outcome)
    }

    pub fn handle_message(&mut self, client: ClientId, message: ClientMessage) {
        match message {
            ClientMessage::StateAck { sequence } => {
                self.handle_ack(client, sequence);
            }
            ClientMessage::RequestFullState => {
                info!(client = %client, "Client requested full state");
                self.request_full_state(client);
            }
        }
    }

    /// Most recently published snapshot
    pub fn latest(&self) -> Option<&Arc<StateSnapshot>> {
        self.compiler.latest()
    }

    /// A published snapshot still held in history
    pub fn snapshot_at(&self, sequence: Sequence) -> Option<&Arc<StateSnapshot>> {
        self.compiler.history().get(sequence)
    }

    /// Capture the world as the next snapshot and build every client's update
    pub fn publish(
        &mut self,
        world: &AuthoritativeWorld,
        game_time: f64,
    ) -> Result<Vec<Outbound>, HistoryError> {
        for ack in self.acks.drain() {
            self.handle_message(ack.client, ack.message);
        }

        let sequence = self.next_sequence;
        let snapshot = Arc::new(world.capture(sequence, game_time));
        self.compiler.record(Arc::clone(&snapshot))?;
        self.next_sequence = sequence.saturating_add(1);

        let plans: Vec<(ClientId, SendPlan)> = self
            .clients
            .iter()
            .map(|(id, tracker)| (*id, tracker.plan(sequence, &self.policy)))
            .collect();

        let compiler = &self.compiler;
        let outbound: Vec<Outbound> = plans
            .par_iter()
            .filter_map(|(client, plan)| {
                let message = match plan {
                    SendPlan::Hold => return None,
                    SendPlan::Full => ServerMessage::FullState(FullState::from_snapshot(&snapshot)),
                    SendPlan::Delta { base } => match compiler.compile(Some(*base), &snapshot) {
                        DeltaOutcome::Delta(delta) => ServerMessage::StateDelta(delta),
                        DeltaOutcome::NeedsFullState => {
                            debug!(client = %client, base, "Client base no longer retained");
                            ServerMessage::FullState(FullState::from_snapshot(&snapshot))
                        }
                        DeltaOutcome::UpToDate => return None,
                    },
                };
                let delivery = match message {
                    ServerMessage::FullState(_) => Delivery::Reliable,
                    ServerMessage::StateDelta(_) => Delivery::Unreliable,
                };
                Some(Outbound {
                    client: *client,
                    message,
                    delivery,
                })
            })
            .collect();

        for out in &outbound {
            let Some(tracker) = self.clients.get_mut(&out.client) else {
                continue;
            };
            match out.delivery {
                Delivery::Reliable => {
                    info!(client = %out.client, sequence, phase = ?tracker.phase(), "Sending full state");
                    tracker.record_sent_full(sequence);
                }
                Delivery::Unreliable => tracker.record_sent_delta(sequence),
            }
        }

        Ok(outbound)
    }
}
