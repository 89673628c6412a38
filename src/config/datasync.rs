use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::AGENT_KEY_ROOT;
use crate::constants::DEFAULT_CHANGE_SEND_TIMEOUT_MS;
use crate::constants::DEFAULT_CHANGE_SINK_CAPACITY;
use crate::constants::DEFAULT_MICROSERVICE_LABEL;
use crate::constants::DEFAULT_RECONNECT_INITIAL_DELAY_MS;
use crate::constants::DEFAULT_RECONNECT_MAX_DELAY_MS;
use crate::constants::DEFAULT_RESYNC_ACCEPT_TIMEOUT_MS;
use crate::constants::DEFAULT_RESYNC_DONE_TIMEOUT_MS;

/// Configuration parameters for the data-change broker and resync orchestration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatasyncConfig {
    /// Microservice label identifying this agent instance;
    /// prepended to every key the broker issues
    #[serde(default = "default_label")]
    pub label: String,

    /// Bounded wait for a subscriber to take a resync event off its sink (ms)
    /// On timeout the subscription is skipped for the cycle but stays registered
    #[serde(default = "default_resync_accept_timeout_ms")]
    pub resync_accept_timeout_ms: u64,

    /// Bounded wait for a subscriber to acknowledge a resync event (ms)
    #[serde(default = "default_resync_done_timeout_ms")]
    pub resync_done_timeout_ms: u64,

    /// Bounded wait for a change sink before the event is dropped (ms)
    /// Change delivery is deliberately lossy under pressure; resync delivery is not
    #[serde(default = "default_change_send_timeout_ms")]
    pub change_send_timeout_ms: u64,

    /// Capacity suggested to subscribers for their change sinks
    #[serde(default = "default_change_sink_capacity")]
    pub change_sink_capacity: usize,

    /// Initial delay before reconnecting a failed watch stream (ms)
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,

    /// Upper bound for the reconnect backoff (ms)
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

impl DatasyncConfig {
    /// Agent-scoped key prefix, e.g. `/vnf-agent/vpp1/`.
    pub fn agent_prefix(&self) -> String {
        format!("{}/{}/", AGENT_KEY_ROOT, self.label)
    }

    pub fn resync_accept_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_accept_timeout_ms)
    }

    pub fn resync_done_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_done_timeout_ms)
    }

    pub fn change_send_timeout(&self) -> Duration {
        Duration::from_millis(self.change_send_timeout_ms)
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl Default for DatasyncConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            resync_accept_timeout_ms: default_resync_accept_timeout_ms(),
            resync_done_timeout_ms: default_resync_done_timeout_ms(),
            change_send_timeout_ms: default_change_send_timeout_ms(),
            change_sink_capacity: default_change_sink_capacity(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

fn default_label() -> String {
    DEFAULT_MICROSERVICE_LABEL.to_string()
}

fn default_resync_accept_timeout_ms() -> u64 {
    DEFAULT_RESYNC_ACCEPT_TIMEOUT_MS
}

fn default_resync_done_timeout_ms() -> u64 {
    DEFAULT_RESYNC_DONE_TIMEOUT_MS
}

fn default_change_send_timeout_ms() -> u64 {
    DEFAULT_CHANGE_SEND_TIMEOUT_MS
}

fn default_change_sink_capacity() -> usize {
    DEFAULT_CHANGE_SINK_CAPACITY
}

fn default_reconnect_initial_delay_ms() -> u64 {
    DEFAULT_RECONNECT_INITIAL_DELAY_MS
}

fn default_reconnect_max_delay_ms() -> u64 {
    DEFAULT_RECONNECT_MAX_DELAY_MS
}
