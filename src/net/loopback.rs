//! In-process transport for soak runs and tests
//!
//! Full states go over a reliable, ordered, length-prefixed byte stream
//! (`tokio::io::duplex`). Deltas and acks go over [`LossySender`], which
//! drops and reorders datagrams with a seeded RNG so runs are repeatable.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::net::ack::{AckChannel, ClientId};
use crate::net::client::SyncClient;
use crate::net::framing::{
    check_size, decode_datagram, encode_for, read_frame, write_frame, FramingError,
};
use crate::net::protocol::{ClientMessage, ServerMessage};
use crate::net::reconciler::{ReconcileError, ReconcileOutcome, ReconcilerConfig, StateReconciler};
use crate::net::registry::LiveWorld;
use crate::net::server::{Delivery, Outbound, SyncServer};
use crate::state::Sequence;
use crate::util::clock::SystemClock;

/// Reliable stream buffer per client
const STREAM_BUFFER: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("Link closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkConfig {
    /// Probability a datagram is dropped
    pub loss: f64,
    /// Probability a datagram is held back behind the next one
    pub reorder: f64,
    pub seed: u64,
}

impl LinkConfig {
    pub fn perfect() -> Self {
        Self {
            loss: 0.0,
            reorder: 0.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub dropped: u64,
    pub reordered: u64,
}

/// Sending half of an unreliable datagram link
pub struct LossySender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rng: StdRng,
    loss: f64,
    reorder: f64,
    held: SmallVec<[Vec<u8>; 2]>,
    stats: LinkStats,
    metrics: Option<Arc<Metrics>>,
}

/// Create an unreliable link: datagrams sent may be lost or arrive out of order
pub fn lossy_link(
    config: LinkConfig,
    metrics: Option<Arc<Metrics>>,
) -> (LossySender, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = LossySender {
        tx,
        rng: StdRng::seed_from_u64(config.seed),
        loss: config.loss.clamp(0.0, 1.0),
        reorder: config.reorder.clamp(0.0, 1.0),
        held: SmallVec::new(),
        stats: LinkStats::default(),
        metrics,
    };
    (sender, rx)
}

impl LossySender {
    pub fn send(&mut self, datagram: Vec<u8>) -> Result<(), LinkError> {
        check_size(Delivery::Unreliable, datagram.len())?;
        self.stats.sent += 1;

        if self.rng.gen_bool(self.loss) {
            self.stats.dropped += 1;
            if let Some(metrics) = &self.metrics {
                metrics.datagrams_lost.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(());
        }
        if self.held.is_empty() && self.rng.gen_bool(self.reorder) {
            self.stats.reordered += 1;
            self.held.push(datagram);
            return Ok(());
        }

        self.tx.send(datagram).map_err(|_| LinkError::Closed)?;
        self.flush()
    }

    /// Deliver anything held back
    pub fn flush(&mut self) -> Result<(), LinkError> {
        for datagram in self.held.drain(..) {
            self.tx.send(datagram).map_err(|_| LinkError::Closed)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

/// Client acks sent as datagrams
pub struct DatagramAcks {
    link: LossySender,
}

impl DatagramAcks {
    pub fn new(link: LossySender) -> Self {
        Self { link }
    }

    fn send(&mut self, message: ClientMessage) {
        let result = encode_for(&message, Delivery::Unreliable)
            .map_err(LinkError::from)
            .and_then(|bytes| self.link.send(bytes));
        if let Err(e) = result {
            warn!(?message, error = %e, "Failed to send client message");
        }
    }
}

impl AckChannel for DatagramAcks {
    fn send_ack(&mut self, sequence: Sequence) {
        self.send(ClientMessage::StateAck { sequence });
    }

    fn request_full_state(&mut self) {
        self.send(ClientMessage::RequestFullState);
    }
}

pub type LoopbackSyncClient = SyncClient<LiveWorld, DatagramAcks, SystemClock>;

/// Result of comparing a client with the server's history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCheck {
    /// At the server's latest snapshot, with matching live objects
    Converged { sequence: Sequence },
    /// Consistent so far but behind (or not started)
    Lagging { sequence: Option<Sequence> },
    /// Holds a state the server never published
    Diverged { sequence: Sequence },
}

/// One client wired to a server over the loopback transport
pub struct LoopbackClient {
    id: ClientId,
    full_writer: DuplexStream,
    delta_link: LossySender,
    full_rx: mpsc::UnboundedReceiver<(ServerMessage, usize)>,
    delta_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    client: LoopbackSyncClient,
    tasks: Vec<JoinHandle<()>>,
}

impl LoopbackClient {
    /// Register a new client with `server` and spawn its transport tasks.
    /// Must be called inside a tokio runtime.
    pub fn connect(
        server: &mut SyncServer,
        reconciler: ReconcilerConfig,
        link: LinkConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let id = server.add_client();
        let (full_writer, mut full_reader) = tokio::io::duplex(STREAM_BUFFER);
        let (full_tx, full_rx) = mpsc::unbounded_channel();

        let reader_metrics = metrics.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame::<_, ServerMessage>(&mut full_reader).await {
                    Ok(received) => {
                        if full_tx.send(received).is_err() {
                            break;
                        }
                    }
                    Err(FramingError::Decode(e)) => {
                        warn!(client = %id, error = %e, "Dropping undecodable full state");
                        reader_metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(FramingError::ConnectionClosed) => break,
                    Err(e) => {
                        warn!(client = %id, error = %e, "Full-state stream failed");
                        break;
                    }
                }
            }
        });

        let (delta_link, delta_rx) = lossy_link(link, Some(metrics.clone()));
        let ack_config = LinkConfig {
            seed: link.seed.wrapping_add(1),
            ..link
        };
        let (ack_link, mut ack_rx) = lossy_link(ack_config, Some(metrics.clone()));

        let submitter = server.ack_submitter();
        let ack_metrics = metrics.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(bytes) = ack_rx.recv().await {
                let message = match decode_datagram::<ClientMessage>(&bytes) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(client = %id, error = %e, "Dropping undecodable client message");
                        continue;
                    }
                };
                match message {
                    ClientMessage::StateAck { .. } => {
                        ack_metrics.acks_received.fetch_add(1, Ordering::Relaxed);
                    }
                    ClientMessage::RequestFullState => {
                        ack_metrics.full_state_requests.fetch_add(1, Ordering::Relaxed);
                    }
                }
                if let Err(e) = submitter.try_send(id, message) {
                    debug!(client = %id, error = %e, "Ack not queued");
                }
            }
        });

        let reconciler = StateReconciler::new(
            reconciler,
            LiveWorld::new(),
            DatagramAcks::new(ack_link),
            SystemClock::new(),
        );

        Self {
            id,
            full_writer,
            delta_link,
            full_rx,
            delta_rx,
            client: SyncClient::new(reconciler, metrics),
            tasks: vec![reader, forwarder],
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn client(&self) -> &LoopbackSyncClient {
        &self.client
    }

    /// Put a server message on the wire its delivery class asks for.
    /// Returns the encoded payload length.
    pub async fn deliver(&mut self, outbound: &Outbound) -> Result<usize, LinkError> {
        match outbound.delivery {
            Delivery::Reliable => Ok(write_frame(&mut self.full_writer, &outbound.message).await?),
            Delivery::Unreliable => {
                let datagram = encode_for(&outbound.message, Delivery::Unreliable)?;
                let len = datagram.len();
                self.delta_link.send(datagram)?;
                Ok(len)
            }
        }
    }

    /// Handle everything that has arrived; returns the number of messages
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok((message, len)) = self.full_rx.try_recv() {
            let result = self.client.handle_received(message, len).map(Some);
            self.report(result);
            handled += 1;
        }
        while let Ok(bytes) = self.delta_rx.try_recv() {
            let result = self.client.handle_bytes(&bytes);
            self.report(result);
            handled += 1;
        }
        handled
    }

    fn report(&self, result: Result<Option<ReconcileOutcome>, ReconcileError>) {
        if let Err(e) = result {
            warn!(client = %self.id, error = %e, "Resync pending");
        }
    }

    pub fn check(&self, server: &SyncServer) -> SyncCheck {
        let reconciler = self.client.reconciler();
        let Some(current) = reconciler.current() else {
            return SyncCheck::Lagging { sequence: None };
        };
        let sequence = current.sequence();

        let Some(published) = server.snapshot_at(sequence) else {
            return SyncCheck::Lagging {
                sequence: Some(sequence),
            };
        };
        if !published.same_state(current) || !reconciler.registry().matches(current) {
            return SyncCheck::Diverged { sequence };
        }
        match server.latest() {
            Some(latest) if latest.sequence() == sequence => SyncCheck::Converged { sequence },
            _ => SyncCheck::Lagging {
                sequence: Some(sequence),
            },
        }
    }
}

impl Drop for LoopbackClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
