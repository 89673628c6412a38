//! A builder pattern implementation for constructing an [`Agent`] from a
//! user-assembled aggregate.
//!
//! The [`AgentBuilder`] provides a fluent interface to configure the agent:
//! the aggregate to discover plugins from, the resync orchestrator to pulse
//! after post-init, and the loaded configuration.
//!
//! ## Example
//! ```ignore
//! let (close_tx, close_rx) = watch::channel(());
//! let agent = AgentBuilder::new(config, close_rx)
//!     .aggregate(aggregate.into_handle())
//!     .orchestrator(orchestrator)
//!     .build()?
//!     .ready()?;
//! agent.run().await?;
//! ```

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use super::Agent;
use crate::discover;
use crate::AgentConfig;
use crate::Error;
use crate::PluginHandle;
use crate::Result;
use crate::ResyncOrchestrator;

pub struct AgentBuilder {
    config: AgentConfig,
    aggregate: Option<PluginHandle>,
    orchestrator: Option<Arc<ResyncOrchestrator>>,
    shutdown_signal: watch::Receiver<()>,
    agent: Option<Arc<Agent>>,
}

impl AgentBuilder {
    /// Creates a new builder.
    ///
    /// # Arguments
    /// * `config` - Loaded agent configuration
    /// * `shutdown_signal` - Watch channel for external close requests
    pub fn new(
        config: AgentConfig,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        Self {
            config,
            aggregate: None,
            orchestrator: None,
            shutdown_signal,
            agent: None,
        }
    }

    /// Sets the aggregate whose dependencies describe the agent.
    pub fn aggregate(
        mut self,
        aggregate: PluginHandle,
    ) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    /// Sets the resync orchestrator pulsed once post-init completes.
    pub fn orchestrator(
        mut self,
        orchestrator: Arc<ResyncOrchestrator>,
    ) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Replaces the entire configuration.
    pub fn config(
        mut self,
        config: AgentConfig,
    ) -> Self {
        self.config = config;
        self
    }

    /// Runs plugin discovery over the aggregate and assembles the agent.
    ///
    /// # Errors
    /// Fails when no aggregate was configured or discovery refuses the
    /// dependency graph.
    pub fn build(mut self) -> Result<Self> {
        let aggregate = self
            .aggregate
            .take()
            .ok_or_else(|| Error::Fatal("no aggregate configured".to_string()))?;

        let plugins = discover(&aggregate)?;
        info!("discovered plugins: {:?}", plugins.names());

        let agent = Agent::new(
            plugins,
            self.config.clone(),
            self.orchestrator.clone(),
            self.shutdown_signal.clone(),
        );
        self.agent = Some(Arc::new(agent));
        Ok(self)
    }

    /// Returns the built agent instance after successful construction.
    pub fn ready(self) -> Result<Arc<Agent>> {
        self.agent
            .ok_or_else(|| Error::Fatal("agent not built".to_string()))
    }
}
