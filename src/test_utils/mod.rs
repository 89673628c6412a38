//! Shared helpers for unit tests: a logger switch and a plugin double that
//! records every lifecycle call it receives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::Error;
use crate::Plugin;
use crate::PluginHandle;
use crate::PostInitPlugin;
use crate::Result;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

/// Chronological record of lifecycle calls across a set of tracked plugins.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn new_event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().clone()
}

/// A plugin double: records `init` / `after_init` / `close` invocations into
/// a shared log and fails or stalls on demand.
pub struct TrackedPlugin {
    name: String,
    log: EventLog,
    deps: Vec<PluginHandle>,
    fail_init: bool,
    fail_after_init: bool,
    fail_close: bool,
    init_delay: Option<Duration>,
}

impl TrackedPlugin {
    pub fn new(
        name: &str,
        log: &EventLog,
    ) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            deps: Vec::new(),
            fail_init: false,
            fail_after_init: false,
            fail_close: false,
            init_delay: None,
        }
    }

    pub fn with_deps(
        mut self,
        deps: Vec<PluginHandle>,
    ) -> Self {
        self.deps = deps;
        self
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn failing_after_init(mut self) -> Self {
        self.fail_after_init = true;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn init_delay(
        mut self,
        delay: Duration,
    ) -> Self {
        self.init_delay = Some(delay);
        self
    }

    pub fn plain_handle(self) -> PluginHandle {
        PluginHandle::plain(Arc::new(self))
    }

    pub fn post_init_handle(self) -> PluginHandle {
        PluginHandle::with_post_init(Arc::new(self))
    }
}

#[async_trait]
impl Plugin for TrackedPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> Result<()> {
        if let Some(delay) = self.init_delay {
            tokio::time::sleep(delay).await;
        }
        self.log.lock().push(format!("init:{}", self.name));
        if self.fail_init {
            return Err(Error::Fatal(format!("{} init refused", self.name)));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().push(format!("close:{}", self.name));
        if self.fail_close {
            return Err(Error::Fatal(format!("{} close refused", self.name)));
        }
        Ok(())
    }

    fn dependencies(&self) -> Vec<PluginHandle> {
        self.deps.clone()
    }
}

#[async_trait]
impl PostInitPlugin for TrackedPlugin {
    async fn after_init(&self) -> Result<()> {
        self.log.lock().push(format!("after_init:{}", self.name));
        if self.fail_after_init {
            return Err(Error::Fatal(format!("{} after-init refused", self.name)));
        }
        Ok(())
    }
}
