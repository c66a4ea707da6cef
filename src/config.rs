// Copyright 2026 Highway RPC Developers

//! Tunables for the client registry, job scheduler and server.
//!
//! Durations are carried as milliseconds so the structs deserialize from any
//! serde format without extra helpers.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::{HighwayError, Result};

pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 10 * 60 * 1000;
pub const DEFAULT_REAP_INTERVAL_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connections per destination.
    pub pool_size: usize,
    /// Upper bound on a two-way call, write included.
    pub call_timeout_ms: u64,
    /// Upper bound on dialing plus the login exchange.
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            pool_size: DEFAULT_POOL_SIZE,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(HighwayError::Config(String::from(
                "pool_size must be at least 1",
            )));
        }
        Ok(())
    }
}

/// What `Scheduler::schedule_job` does when a destination's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueFullPolicy {
    Block,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    /// A destination with no scheduled job for this long is reaped.
    pub idle_timeout_ms: u64,
    pub reap_interval_ms: u64,
    pub call_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub full_policy: QueueFullPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> SchedulerConfig {
        SchedulerConfig {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            reap_interval_ms: DEFAULT_REAP_INTERVAL_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            full_policy: QueueFullPolicy::Block,
        }
    }
}

impl SchedulerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(HighwayError::Config(String::from(
                "queue_capacity must be at least 1",
            )));
        }
        if self.reap_interval_ms == 0 {
            return Err(HighwayError::Config(String::from(
                "reap_interval_ms must be non-zero",
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// How long an accepted socket may take to send its login frame.
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            handshake_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: ClientConfig = serde_json::from_str(r#"{"pool_size": 2}"#).unwrap();
        assert_eq!(cfg.pool_size, 2);
        assert_eq!(cfg.call_timeout(), Duration::from_secs(30));

        let sched: SchedulerConfig =
            serde_json::from_str(r#"{"full_policy": "reject"}"#).unwrap();
        assert_eq!(sched.full_policy, QueueFullPolicy::Reject);
        assert_eq!(sched.idle_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn zero_pool_size_is_invalid() {
        let cfg = ClientConfig {
            pool_size: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(HighwayError::Config(_))));
    }
}
