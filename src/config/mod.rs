//! Configuration management for the agent runtime.
//!
//! Provides hierarchical configuration loading from multiple sources with priority:
//! 1. Default values (hardcoded)
//! 2. Main config file
//! 3. Local overrides
//! 4. Environment variables (highest priority)
//!
//! The `MICROSERVICE_LABEL` environment variable is read last and overrides
//! the datasync label regardless of file content.

mod datasync;
mod lifecycle;
pub use datasync::*;
pub use lifecycle::*;


//---
use crate::constants::MICROSERVICE_LABEL_ENV;
use crate::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AgentConfig {
    /// Startup and shutdown phase parameters
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Data-change broker and resync parameters
    #[serde(default)]
    pub datasync: DatasyncConfig,
}

impl AgentConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Main config file (when a path is given)
    /// 2. `CONFIG_PATH` file
    /// 3. Local overrides
    /// 4. Environment variables
    ///
    /// # Arguments
    /// * `config_path` - Optional path to the main configuration file
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Config::builder();

        // 1. Main config
        if let Some(path) = config_path {
            config = config.add_source(File::with_name(path).required(true));
        }

        // 2. Deployment-provided config
        if let Ok(path) = env::var("CONFIG_PATH") {
            config = config.add_source(File::with_name(&path));
        }

        // 3. Local overrides
        config = config.add_source(File::with_name("config/local").required(false));

        // 4. Environment variables (highest priority)
        config = config.add_source(
            Environment::with_prefix("AGENT")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let mut loaded: AgentConfig = config.build()?.try_deserialize()?;

        // MICROSERVICE_LABEL wins over any file-provided label.
        if let Ok(label) = env::var(MICROSERVICE_LABEL_ENV) {
            if !label.is_empty() {
                loaded.datasync.label = label;
            }
        }

        Ok(loaded)
    }
}
