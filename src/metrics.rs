//! Prometheus-compatible metrics endpoint
//!
//! Exposes sync counters in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::net::reconciler::ReconcileStats;

const PUBLISH_HISTORY: usize = 1000;

/// Metrics registry shared by the server loop and every client
#[derive(Debug)]
pub struct Metrics {
    // Server publishing
    pub publish_count: AtomicU64,
    pub publish_time_us: AtomicU64,
    pub publish_time_p95_us: AtomicU64,
    pub publish_time_p99_us: AtomicU64,
    pub publish_time_max_us: AtomicU64,
    pub snapshot_sequence: AtomicU64,
    pub entity_count: AtomicU64,
    pub clients_connected: AtomicU64,

    // Outbound
    pub full_states_sent: AtomicU64,
    pub deltas_sent: AtomicU64,
    pub delta_records_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub datagrams_lost: AtomicU64,

    // Inbound (client side)
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub decode_failures: AtomicU64,

    // Reconciliation
    pub full_states_applied: AtomicU64,
    pub deltas_applied: AtomicU64,
    pub deltas_duplicate: AtomicU64,
    pub deltas_dropped_unknown_base: AtomicU64,
    pub deltas_dropped_malformed: AtomicU64,
    pub deltas_dropped_awaiting_initial: AtomicU64,
    pub parked_recovered: AtomicU64,
    pub desyncs: AtomicU64,

    // Acks seen by the server
    pub acks_received: AtomicU64,
    pub full_state_requests: AtomicU64,

    start_time: Instant,

    // Rolling publish times for percentile calculation
    publish_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            publish_count: AtomicU64::new(0),
            publish_time_us: AtomicU64::new(0),
            publish_time_p95_us: AtomicU64::new(0),
            publish_time_p99_us: AtomicU64::new(0),
            publish_time_max_us: AtomicU64::new(0),
            snapshot_sequence: AtomicU64::new(0),
            entity_count: AtomicU64::new(0),
            clients_connected: AtomicU64::new(0),
            full_states_sent: AtomicU64::new(0),
            deltas_sent: AtomicU64::new(0),
            delta_records_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            datagrams_lost: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            full_states_applied: AtomicU64::new(0),
            deltas_applied: AtomicU64::new(0),
            deltas_duplicate: AtomicU64::new(0),
            deltas_dropped_unknown_base: AtomicU64::new(0),
            deltas_dropped_malformed: AtomicU64::new(0),
            deltas_dropped_awaiting_initial: AtomicU64::new(0),
            parked_recovered: AtomicU64::new(0),
            desyncs: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            full_state_requests: AtomicU64::new(0),
            start_time: Instant::now(),
            publish_history: RwLock::new(VecDeque::with_capacity(PUBLISH_HISTORY)),
        }
    }

    /// Record a publish duration and update percentiles
    pub fn record_publish_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.publish_time_us.store(us, Ordering::Relaxed);
        self.publish_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.publish_history.write();
        history.push_back(us);
        while history.len() > PUBLISH_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.publish_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.publish_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.publish_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Add whatever a reconciler counted between two readings of its stats
    pub fn record_reconcile(&self, before: &ReconcileStats, after: &ReconcileStats) {
        let add = |counter: &AtomicU64, a: u64, b: u64| {
            if b > a {
                counter.fetch_add(b - a, Ordering::Relaxed);
            }
        };
        add(&self.full_states_applied, before.full_states_applied, after.full_states_applied);
        add(&self.deltas_applied, before.deltas_applied, after.deltas_applied);
        add(&self.deltas_duplicate, before.duplicates, after.duplicates);
        add(
            &self.deltas_dropped_unknown_base,
            before.dropped_unknown_base,
            after.dropped_unknown_base,
        );
        add(&self.deltas_dropped_malformed, before.dropped_malformed, after.dropped_malformed);
        add(
            &self.deltas_dropped_awaiting_initial,
            before.dropped_awaiting_initial,
            after.dropped_awaiting_initial,
        );
        add(&self.parked_recovered, before.parked_recovered, after.parked_recovered);
        add(&self.desyncs, before.desyncs, after.desyncs);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Publishing
        metric!("snapsync_publish_total", "Snapshots published", "counter",
            self.publish_count.load(Ordering::Relaxed));
        metric!("snapsync_publish_time_microseconds", "Last publish time in microseconds", "gauge",
            self.publish_time_us.load(Ordering::Relaxed));
        metric!("snapsync_publish_time_p95_microseconds", "95th percentile publish time", "gauge",
            self.publish_time_p95_us.load(Ordering::Relaxed));
        metric!("snapsync_publish_time_p99_microseconds", "99th percentile publish time", "gauge",
            self.publish_time_p99_us.load(Ordering::Relaxed));
        metric!("snapsync_publish_time_max_microseconds", "Maximum publish time", "gauge",
            self.publish_time_max_us.load(Ordering::Relaxed));
        metric!("snapsync_snapshot_sequence", "Latest published sequence", "gauge",
            self.snapshot_sequence.load(Ordering::Relaxed));
        metric!("snapsync_entities", "Entities in the authoritative world", "gauge",
            self.entity_count.load(Ordering::Relaxed));
        metric!("snapsync_clients_connected", "Connected clients", "gauge",
            self.clients_connected.load(Ordering::Relaxed));

        // Outbound
        metric!("snapsync_full_states_sent_total", "Full states sent", "counter",
            self.full_states_sent.load(Ordering::Relaxed));
        metric!("snapsync_deltas_sent_total", "Deltas sent", "counter",
            self.deltas_sent.load(Ordering::Relaxed));
        metric!("snapsync_delta_records_sent_total", "Records carried by deltas", "counter",
            self.delta_records_sent.load(Ordering::Relaxed));
        metric!("snapsync_bytes_sent_total", "Total bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("snapsync_datagrams_lost_total", "Datagrams dropped by the link", "counter",
            self.datagrams_lost.load(Ordering::Relaxed));

        // Inbound
        metric!("snapsync_messages_received_total", "Messages received by clients", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("snapsync_bytes_received_total", "Total bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("snapsync_decode_failures_total", "Messages that failed to decode", "counter",
            self.decode_failures.load(Ordering::Relaxed));

        // Reconciliation
        metric!("snapsync_full_states_applied_total", "Full states applied", "counter",
            self.full_states_applied.load(Ordering::Relaxed));
        metric!("snapsync_deltas_applied_total", "Deltas applied", "counter",
            self.deltas_applied.load(Ordering::Relaxed));
        metric!("snapsync_deltas_duplicate_total", "Duplicate deltas", "counter",
            self.deltas_duplicate.load(Ordering::Relaxed));
        metric!("snapsync_deltas_dropped_unknown_base_total", "Deltas dropped for an unknown base", "counter",
            self.deltas_dropped_unknown_base.load(Ordering::Relaxed));
        metric!("snapsync_deltas_dropped_malformed_total", "Malformed messages dropped", "counter",
            self.deltas_dropped_malformed.load(Ordering::Relaxed));
        metric!("snapsync_deltas_dropped_awaiting_initial_total", "Deltas dropped before the initial state", "counter",
            self.deltas_dropped_awaiting_initial.load(Ordering::Relaxed));
        metric!("snapsync_parked_recovered_total", "Parked deltas applied once their base arrived", "counter",
            self.parked_recovered.load(Ordering::Relaxed));
        metric!("snapsync_desyncs_total", "Snapshot conflicts detected", "counter",
            self.desyncs.load(Ordering::Relaxed));

        // Acks
        metric!("snapsync_acks_received_total", "Acks received by the server", "counter",
            self.acks_received.load(Ordering::Relaxed));
        metric!("snapsync_full_state_requests_total", "Full states requested by clients", "counter",
            self.full_state_requests.load(Ordering::Relaxed));

        metric!("snapsync_uptime_seconds", "Uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// JSON rendering for direct API access
    pub fn to_json(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let value = serde_json::json!({
            "publish": {
                "count": load(&self.publish_count),
                "time_us": load(&self.publish_time_us),
                "time_p95_us": load(&self.publish_time_p95_us),
                "time_p99_us": load(&self.publish_time_p99_us),
                "time_max_us": load(&self.publish_time_max_us),
                "sequence": load(&self.snapshot_sequence),
                "entities": load(&self.entity_count),
                "clients": load(&self.clients_connected),
            },
            "outbound": {
                "full_states": load(&self.full_states_sent),
                "deltas": load(&self.deltas_sent),
                "delta_records": load(&self.delta_records_sent),
                "bytes": load(&self.bytes_sent),
                "datagrams_lost": load(&self.datagrams_lost),
            },
            "inbound": {
                "messages": load(&self.messages_received),
                "bytes": load(&self.bytes_received),
                "decode_failures": load(&self.decode_failures),
            },
            "reconcile": {
                "full_states_applied": load(&self.full_states_applied),
                "deltas_applied": load(&self.deltas_applied),
                "duplicates": load(&self.deltas_duplicate),
                "dropped_unknown_base": load(&self.deltas_dropped_unknown_base),
                "dropped_malformed": load(&self.deltas_dropped_malformed),
                "dropped_awaiting_initial": load(&self.deltas_dropped_awaiting_initial),
                "parked_recovered": load(&self.parked_recovered),
                "desyncs": load(&self.desyncs),
            },
            "acks": {
                "received": load(&self.acks_received),
                "full_state_requests": load(&self.full_state_requests),
            },
            "uptime_seconds": self.uptime_seconds(),
        });
        serde_json::to_string_pretty(&value).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    let response = if request.starts_with("GET /metrics/json") {
                        http_response("application/json", &metrics.to_json())
                    } else if request.starts_with("GET /metrics") {
                        http_response("text/plain; version=0.0.4", &metrics.to_prometheus())
                    } else if request.starts_with("GET /health") {
                        http_response("text/plain", "OK")
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
