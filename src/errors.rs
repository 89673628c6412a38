//! Agent Runtime Error Hierarchy
//!
//! Defines the error types for the plugin-lifecycle runtime, categorized by
//! subsystem: lifecycle phases, datasync delivery, registry lookups, and the
//! external key-value collaborator.

use std::fmt;
use std::time::Duration;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Startup, rollback and shutdown failures
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Data-change broker and resync failures
    #[error(transparent)]
    Datasync(#[from] DatasyncError),

    /// Named-mapping lookup failures
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// External key-value store failures
    #[error(transparent)]
    Kv(#[from] KvError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unrecoverable programmer errors requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// A plugin's `init` returned non-success; triggers rollback
    #[error("plugin {plugin} failed to initialize: {source}")]
    Init {
        plugin: String,
        #[source]
        source: Box<Error>,
    },

    /// A plugin's `after_init` returned non-success; triggers full reverse close
    #[error("plugin {plugin} failed in after-init: {source}")]
    PostInit {
        plugin: String,
        #[source]
        source: Box<Error>,
    },

    /// Init and after-init together exceeded the startup budget
    #[error("startup did not complete within {0:?}")]
    StartupTimeout(Duration),

    /// One or more plugins failed to close cleanly; the sweep still visited all
    #[error(transparent)]
    Close(#[from] CloseErrors),

    /// `start` invoked on an agent that already left the created state
    #[error("agent already started")]
    AlreadyStarted,

    /// Signal handler installation failed
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

/// Aggregate of per-plugin close failures collected during a shutdown sweep.
///
/// Close errors never abort the sweep; they are gathered here and surfaced
/// once the reverse-order pass has visited every plugin. Repeated `stop`
/// calls return the same aggregate, so the entries keep rendered messages
/// rather than live error values.
#[derive(Debug, Default, Clone)]
pub struct CloseErrors(pub Vec<(String, String)>);

impl CloseErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(
        &mut self,
        plugin: &str,
        error: &Error,
    ) {
        self.0.push((plugin.to_string(), error.to_string()));
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{} plugin(s) failed to close:", self.0.len())?;
        for (plugin, error) in &self.0 {
            write!(f, " [{}: {}]", plugin, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseErrors {}

#[derive(Debug, thiserror::Error)]
pub enum DatasyncError {
    /// Listing the external store for a prefix failed; reported on the
    /// resync acknowledgement path
    #[error("listing key prefix {prefix} failed: {source}")]
    ResyncList {
        prefix: String,
        #[source]
        source: Box<Error>,
    },

    /// A change or resync sink could not accept within its bounded timeout
    #[error("subscription {subject} did not accept delivery within {timeout:?}")]
    SubscriptionBusy { subject: String, timeout: Duration },

    /// The external store's watch stream terminated
    #[error("key-value watch stream closed")]
    WatchClosed,

    /// `put`/`delete` called before the broker completed after-init
    #[error("publishing is only available after the broker completed after-init")]
    PutBeforeReady,

    /// `watch` called after the broker entered after-init
    #[error("subscriptions are only accepted before the broker enters after-init")]
    WatchAfterInit,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Secondary lookup against an index the extractor never produced
    #[error("unknown secondary index: {0}")]
    UnknownIndex(String),
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The external store rejected or could not serve a request
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    /// The client was closed while requests were in flight
    #[error("key-value client closed")]
    Closed,
}

// ============== Conversion Implementations ============== //
impl From<CloseErrors> for Error {
    fn from(e: CloseErrors) -> Self {
        Error::Lifecycle(LifecycleError::Close(e))
    }
}
