use std::str::FromStr;

use crate::net::ack::ResyncPolicy;
use crate::net::reconciler::ReconcilerConfig;
use crate::net::server::ServerConfig;

/// Sync and soak-run configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Server ticks per second
    pub tick_rate: u32,
    /// Snapshots the server keeps as possible delta bases
    pub history_capacity: usize,
    /// Hard bound on each client's snapshot window
    pub window_capacity: usize,
    /// Deltas a client parks while waiting for their base (0 disables)
    pub pending_capacity: usize,
    /// Unacked deltas before the server forces a full state (0 disables)
    pub stall_resync_threshold: u32,
    /// Sequences to wait for a full-state ack before re-sending
    pub full_state_resend_after: u32,
    /// Capacity of the server's ack intake queue
    pub ack_buffer_capacity: usize,
    /// Metrics endpoint port (0 disables)
    pub metrics_port: u16,
    pub sim_entities: usize,
    pub sim_clients: usize,
    pub sim_ticks: u32,
    /// Probability a datagram is dropped
    pub link_loss: f64,
    /// Probability a datagram is held back and delivered after the next one
    pub link_reorder: f64,
    pub link_seed: u64,
    /// Write the final server snapshot here as JSON
    pub snapshot_dump_path: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_rate: 30,
            history_capacity: 32,
            window_capacity: 64,
            pending_capacity: 8,
            stall_resync_threshold: 30,
            full_state_resend_after: 20,
            ack_buffer_capacity: 4096,
            metrics_port: 9090,
            sim_entities: 200,
            sim_clients: 4,
            sim_ticks: 600,
            link_loss: 0.05,
            link_reorder: 0.1,
            link_seed: 42,
            snapshot_dump_path: None,
        }
    }
}

/// Overwrite `value` from env var `name` if it parses and passes `accept`
fn env_override<T: FromStr>(name: &str, value: &mut T, accept: impl Fn(&T) -> bool, rule: &str) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(parsed) if accept(&parsed) => *value = parsed,
        Ok(_) => tracing::warn!("{} must be {}, using default", name, rule),
        Err(_) => tracing::warn!("Invalid {} '{}', using default", name, raw),
    }
}

impl SyncConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        env_override("TICK_RATE", &mut config.tick_rate, |v| (1..=240).contains(v), "1-240");
        env_override("HISTORY_CAPACITY", &mut config.history_capacity, |v| *v > 0, "> 0");
        env_override("WINDOW_CAPACITY", &mut config.window_capacity, |v| *v > 0, "> 0");
        env_override("PENDING_CAPACITY", &mut config.pending_capacity, |v| *v <= 1024, "0-1024");
        env_override("STALL_RESYNC_THRESHOLD", &mut config.stall_resync_threshold, |_| true, "");
        env_override("FULL_STATE_RESEND_AFTER", &mut config.full_state_resend_after, |v| *v > 0, "> 0");
        env_override("METRICS_PORT", &mut config.metrics_port, |_| true, "");
        env_override("SIM_ENTITIES", &mut config.sim_entities, |v| *v <= 100_000, "0-100000");
        env_override("SIM_CLIENTS", &mut config.sim_clients, |v| (1..=256).contains(v), "1-256");
        env_override("SIM_TICKS", &mut config.sim_ticks, |v| *v > 0, "> 0");
        env_override("LINK_LOSS", &mut config.link_loss, |v| (0.0..1.0).contains(v), "in [0, 1)");
        env_override("LINK_REORDER", &mut config.link_reorder, |v| (0.0..=1.0).contains(v), "in [0, 1]");
        env_override("LINK_SEED", &mut config.link_seed, |_| true, "");

        if let Ok(path) = std::env::var("SNAPSHOT_DUMP_PATH") {
            if !path.is_empty() {
                config.snapshot_dump_path = Some(path);
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_rate == 0 {
            return Err("tick_rate must be at least 1".to_string());
        }
        if self.history_capacity == 0 {
            return Err("history_capacity must be at least 1".to_string());
        }
        if self.window_capacity <= self.history_capacity {
            return Err("window_capacity must exceed history_capacity".to_string());
        }
        if self.full_state_resend_after == 0 {
            return Err("full_state_resend_after must be at least 1".to_string());
        }
        if self.ack_buffer_capacity == 0 {
            return Err("ack_buffer_capacity must be at least 1".to_string());
        }
        if !(0.0..1.0).contains(&self.link_loss) {
            return Err("link_loss must be in [0, 1)".to_string());
        }
        if !(0.0..=1.0).contains(&self.link_reorder) {
            return Err("link_reorder must be in [0, 1]".to_string());
        }
        Ok(())
    }

    pub fn tick_seconds(&self) -> f64 {
        1.0 / self.tick_rate.max(1) as f64
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            history_capacity: self.history_capacity,
            ack_buffer_capacity: self.ack_buffer_capacity,
            policy: ResyncPolicy {
                stall_threshold: self.stall_resync_threshold,
                full_state_resend_after: self.full_state_resend_after,
            },
        }
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            window_capacity: self.window_capacity,
            pending_capacity: self.pending_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.history_capacity, 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = SyncConfig::load_or_default();
        assert!(config.tick_rate > 0);
    }

    #[test]
    fn test_validate_window_must_exceed_history() {
        let config = SyncConfig {
            window_capacity: 16,
            history_capacity: 16,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_link_probabilities() {
        let config = SyncConfig {
            link_loss: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        let mut value = 5usize;

        std::env::set_var("SNAPSYNC_TEST_OVERRIDE_OK", "12");
        env_override("SNAPSYNC_TEST_OVERRIDE_OK", &mut value, |v| *v > 0, "> 0");
        assert_eq!(value, 12);

        std::env::set_var("SNAPSYNC_TEST_OVERRIDE_ZERO", "0");
        env_override("SNAPSYNC_TEST_OVERRIDE_ZERO", &mut value, |v| *v > 0, "> 0");
        assert_eq!(value, 12);

        std::env::set_var("SNAPSYNC_TEST_OVERRIDE_BAD", "twelve");
        env_override("SNAPSYNC_TEST_OVERRIDE_BAD", &mut value, |v| *v > 0, "> 0");
        assert_eq!(value, 12);

        env_override("SNAPSYNC_TEST_OVERRIDE_UNSET", &mut value, |v| *v > 0, "> 0");
        assert_eq!(value, 12);
    }

    #[test]
    fn test_derived_configs() {
        let config = SyncConfig::default();
        assert_eq!(config.server().policy.stall_threshold, 30);
        assert_eq!(config.reconciler().pending_capacity, 8);
        assert!((config.tick_seconds() - 1.0 / 30.0).abs() < 1e-12);
    }
}
