use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_MAX_STARTUP_TIME_MS;

/// Configuration parameters for the agent lifecycle engine
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Budget for the init and after-init phases together (milliseconds)
    /// Crossing it rolls back whatever was initialized
    #[serde(default = "default_max_startup_time_ms")]
    pub max_startup_time_ms: u64,
}

impl LifecycleConfig {
    pub fn max_startup_time(&self) -> Duration {
        Duration::from_millis(self.max_startup_time_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_startup_time_ms: default_max_startup_time_ms(),
        }
    }
}

fn default_max_startup_time_ms() -> u64 {
    DEFAULT_MAX_STARTUP_TIME_MS
}
