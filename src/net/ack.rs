//! Acknowledgement handling on both ends of the link
//!
//! The client acks every snapshot it applies. The server treats the newest
//! ack as a hint for which base to diff against; acks may be lost or
//! reordered, which only costs bandwidth.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use uuid::Uuid;

use crate::net::protocol::ClientMessage;
use crate::state::Sequence;

/// Server-side connection identity
pub type ClientId = Uuid;

// ============================================================================
// Client end
// ============================================================================

/// Outgoing acknowledgement path from a client to the server
pub trait AckChannel {
    /// Snapshot `sequence` was applied and may be used as a delta base
    fn send_ack(&mut self, sequence: Sequence);

    /// Local history is inconsistent; ask for a full state
    fn request_full_state(&mut self);
}

/// Records everything sent through it
#[derive(Debug, Default, Clone)]
pub struct AckLog {
    pub acks: Vec<Sequence>,
    pub full_state_requests: usize,
}

impl AckLog {
    pub fn last_ack(&self) -> Option<Sequence> {
        self.acks.last().copied()
    }
}

impl AckChannel for AckLog {
    fn send_ack(&mut self, sequence: Sequence) {
        self.acks.push(sequence);
    }

    fn request_full_state(&mut self) {
        self.full_state_requests += 1;
    }
}

// ============================================================================
// Server end
// ============================================================================

/// When the server gives up on deltas and sends a full state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncPolicy {
    /// Consecutive deltas sent without the ack advancing (0 disables)
    pub stall_threshold: u32,
    /// Sequences to wait for a full-state ack before sending another
    pub full_state_resend_after: u32,
}

impl Default for ResyncPolicy {
    fn default() -> Self {
        Self {
            stall_threshold: 30,
            full_state_resend_after: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPhase {
    /// Nothing sent yet
    Fresh,
    /// A full state went out at `sequence` and has not been acked
    AwaitingFullAck { sequence: Sequence },
    /// Client holds `last_acked`; deltas are diffed against it
    Streaming { last_acked: Sequence },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The delta base moved forward
    Advanced,
    /// Not newer than the current base (late or duplicate delivery)
    Stale,
    /// Never sent to this client; ignored
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPlan {
    Full,
    /// Diff against `base`, which the client acknowledged
    Delta { base: Sequence },
    /// Waiting for a full-state ack
    Hold,
}

/// Per-client ack bookkeeping
#[derive(Debug, Clone)]
pub struct AckTracker {
    phase: AckPhase,
    force_full: bool,
    deltas_since_advance: u32,
    highest_sent: Option<Sequence>,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            phase: AckPhase::Fresh,
            force_full: false,
            deltas_since_advance: 0,
            highest_sent: None,
        }
    }

    pub fn phase(&self) -> AckPhase {
        self.phase
    }

    /// Last acknowledged sequence usable as a delta base
    pub fn last_acked(&self) -> Option<Sequence> {
        match self.phase {
            AckPhase::Streaming { last_acked } => Some(last_acked),
            _ => None,
        }
    }

    pub fn deltas_since_advance(&self) -> u32 {
        self.deltas_since_advance
    }

    pub fn record_ack(&mut self, sequence: Sequence) -> AckOutcome {
        match self.highest_sent {
            Some(highest) if sequence <= highest => {}
            _ => return AckOutcome::Unknown,
        }

        let advanced = match self.phase {
            AckPhase::Fresh => return AckOutcome::Unknown,
            // Anything older than the full state predates the client's reset
            AckPhase::AwaitingFullAck { sequence: full } => sequence >= full,
            AckPhase::Streaming { last_acked } => sequence > last_acked,
        };

        if advanced {
            self.phase = AckPhase::Streaming {
                last_acked: sequence,
            };
            self.deltas_since_advance = 0;
            AckOutcome::Advanced
        } else {
            AckOutcome::Stale
        }
    }

    /// Force a full state on the next plan
    pub fn request_full(&mut self) {
        self.force_full = true;
    }

    /// Decide what this client gets for snapshot `current`
    pub fn plan(&self, current: Sequence, policy: &ResyncPolicy) -> SendPlan {
        if self.force_full {
            return SendPlan::Full;
        }
        match self.phase {
            AckPhase::Fresh => SendPlan::Full,
            AckPhase::AwaitingFullAck { sequence } => {
                if current.saturating_sub(sequence) >= policy.full_state_resend_after {
                    SendPlan::Full
                } else {
                    SendPlan::Hold
                }
            }
            AckPhase::Streaming { last_acked } => {
                if policy.stall_threshold > 0
                    && self.deltas_since_advance >= policy.stall_threshold
                {
                    SendPlan::Full
                } else {
                    SendPlan::Delta { base: last_acked }
                }
            }
        }
    }

    pub fn record_sent_full(&mut self, sequence: Sequence) {
        self.phase = AckPhase::AwaitingFullAck { sequence };
        self.force_full = false;
        self.deltas_since_advance = 0;
        self.note_sent(sequence);
    }

    pub fn record_sent_delta(&mut self, sequence: Sequence) {
        self.deltas_since_advance += 1;
        self.note_sent(sequence);
    }

    fn note_sent(&mut self, sequence: Sequence) {
        self.highest_sent = Some(self.highest_sent.map_or(sequence, |h| h.max(sequence)));
    }
}

// ============================================================================
// Ack intake
// ============================================================================

/// Message from a client connection, queued for the next publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMessage {
    pub client: ClientId,
    pub message: ClientMessage,
}

/// Lock-free queue from connection handlers to the server tick
///
/// Handlers submit through [`AckSubmitter`] clones without blocking; the
/// server drains everything at the start of each publish.
pub struct AckBuffer {
    sender: Sender<AckMessage>,
    receiver: Receiver<AckMessage>,
    capacity: usize,
}

impl AckBuffer {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    pub fn submitter(&self) -> AckSubmitter {
        AckSubmitter {
            sender: self.sender.clone(),
        }
    }

    pub fn drain(&self) -> Vec<AckMessage> {
        self.receiver.try_iter().collect()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AckBuffer {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// Clonable submit handle for connection handlers
#[derive(Clone)]
pub struct AckSubmitter {
    sender: Sender<AckMessage>,
}

impl AckSubmitter {
    #[inline]
    pub fn try_send(&self, client: ClientId, message: ClientMessage) -> Result<(), AckBufferError> {
        self.sender
            .try_send(AckMessage { client, message })
            .map_err(|e| match e {
                TrySendError::Full(_) => AckBufferError::Full,
                TrySendError::Disconnected(_) => AckBufferError::Disconnected,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AckBufferError {
    #[error("Ack buffer full")]
    Full,
    #[error("Ack buffer disconnected")]
    Disconnected,
}
