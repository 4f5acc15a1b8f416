//! Client message intake: decode, reconcile, count

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::warn;

use crate::metrics::Metrics;
use crate::net::ack::AckChannel;
use crate::net::framing;
use crate::net::protocol::ServerMessage;
use crate::net::reconciler::{ReconcileError, ReconcileOutcome, StateReconciler};
use crate::net::registry::EntityRegistry;
use crate::util::clock::Clock;

pub struct SyncClient<R, A, C> {
    reconciler: StateReconciler<R, A, C>,
    metrics: Arc<Metrics>,
}

impl<R: EntityRegistry, A: AckChannel, C: Clock> SyncClient<R, A, C> {
    pub fn new(reconciler: StateReconciler<R, A, C>, metrics: Arc<Metrics>) -> Self {
        Self {
            reconciler,
            metrics,
        }
    }

    pub fn reconciler(&self) -> &StateReconciler<R, A, C> {
        &self.reconciler
    }

    /// Decode and handle one server datagram.
    ///
    /// Datagrams that do not decode are dropped with a warning (`Ok(None)`);
    /// the tick loop carries on.
    pub fn handle_bytes(&mut self, bytes: &[u8]) -> Result<Option<ReconcileOutcome>, ReconcileError> {
        match framing::decode_datagram::<ServerMessage>(bytes) {
            Ok(message) => self.handle_received(message, bytes.len()).map(Some),
            Err(e) => {
                warn!(len = bytes.len(), error = %e, "Dropping undecodable server message");
                self.count_received(bytes.len());
                self.metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Handle a message the transport already decoded from `wire_len` bytes
    pub fn handle_received(
        &mut self,
        message: ServerMessage,
        wire_len: usize,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.count_received(wire_len);
        self.handle_message(message)
    }

    fn count_received(&self, wire_len: usize) {
        self.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_received
            .fetch_add(wire_len as u64, Ordering::Relaxed);
    }

    pub fn handle_message(&mut self, message: ServerMessage) -> Result<ReconcileOutcome, ReconcileError> {
        let before = self.reconciler.stats();
        let result = match message {
            ServerMessage::FullState(full) => self.reconciler.apply_full_state(full),
            ServerMessage::StateDelta(delta) => self.reconciler.apply_delta(&delta),
        };
        self.metrics.record_reconcile(&before, &self.reconciler.stats());
        result
    }
}
