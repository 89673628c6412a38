//! The agent lifecycle engine.
//!
//! Drives the plugin list through its phases: serialized `init` in
//! discoverer order, serialized `after_init` over the plugins that offer it,
//! a suspension on signal-or-close, and a reverse-order close sweep. Both
//! startup phases together are bounded by the configured budget; crossing it
//! rolls back whatever was initialized, closing the plugin whose `init` was
//! still in flight once it returns.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::AgentConfig;
use crate::CloseErrors;
use crate::Error;
use crate::LifecycleError;
use crate::PluginList;
use crate::Result;
use crate::ResyncOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Created,
    Initializing,
    Running,
    Closed,
}

const STATE_CREATED: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Indices of plugins whose `init` completed, shared with the pipeline task
/// so the rollback path sees exactly what was initialized even while the
/// pipeline is still running.
#[derive(Default)]
struct StartupProgress {
    completed: Vec<usize>,
}

pub struct Agent {
    plugins: PluginList,
    config: AgentConfig,
    orchestrator: Option<Arc<ResyncOrchestrator>>,
    state: AtomicU8,
    progress: Arc<Mutex<StartupProgress>>,
    cancel_startup: CancellationToken,
    shutdown_rx: watch::Receiver<()>,
    /// Recorded close aggregate; repeated `stop` returns it without
    /// reinvoking plugins.
    close_result: Mutex<Option<CloseErrors>>,
    stop_gate: tokio::sync::Mutex<()>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Agent {
    pub(crate) fn new(
        plugins: PluginList,
        config: AgentConfig,
        orchestrator: Option<Arc<ResyncOrchestrator>>,
        shutdown_rx: watch::Receiver<()>,
    ) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            plugins,
            config,
            orchestrator,
            state: AtomicU8::new(STATE_CREATED),
            progress: Arc::new(Mutex::new(StartupProgress::default())),
            cancel_startup: CancellationToken::new(),
            shutdown_rx,
            close_result: Mutex::new(None),
            stop_gate: tokio::sync::Mutex::new(()),
            done_tx,
            done_rx,
        }
    }

    pub fn plugins(&self) -> &PluginList {
        &self.plugins
    }

    pub fn state(&self) -> AgentState {
        match self.state.load(Ordering::Acquire) {
            STATE_CREATED => AgentState::Created,
            STATE_INITIALIZING => AgentState::Initializing,
            STATE_RUNNING => AgentState::Running,
            _ => AgentState::Closed,
        }
    }

    /// Resolves to `true` once the close sweep (or rollback) has finished.
    pub fn done_signal(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Run the init and after-init phases over the plugin list, bounded by
    /// the startup budget. On the first failure the already-initialized
    /// prefix is closed in reverse order and the original error returned;
    /// crossing the budget yields the distinct timeout error instead.
    pub async fn start(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(LifecycleError::AlreadyStarted.into());
        }

        info!("starting agent with plugins: {:?}", self.plugins.names());
        let budget = self.config.lifecycle.max_startup_time();

        let plugins = self.plugins.clone();
        let progress = self.progress.clone();
        let cancel = self.cancel_startup.clone();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let pipeline = tokio::spawn(async move {
            let result = startup_pipeline(&plugins, &progress, &cancel).await;
            let _ = outcome_tx.send(result);
        });

        match timeout(budget, outcome_rx).await {
            Ok(Ok(Ok(()))) => {
                self.state.store(STATE_RUNNING, Ordering::Release);
                if let Some(orchestrator) = &self.orchestrator {
                    orchestrator.trigger_resync().await;
                }
                info!("agent running");
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                error!("startup failed: {}", e);
                self.rollback_now().await;
                Err(e)
            }
            Ok(Err(_)) => {
                self.rollback_now().await;
                Err(Error::Fatal("startup pipeline aborted".to_string()))
            }
            Err(_) => {
                let e = LifecycleError::StartupTimeout(budget);
                error!("{}", e);
                self.cancel_startup.cancel();
                self.state.store(STATE_CLOSED, Ordering::Release);
                *self.close_result.lock() = Some(CloseErrors::default());

                // the in-flight init may still be running; close its plugin
                // once it returns
                let plugins = self.plugins.clone();
                let progress = self.progress.clone();
                let done_tx = self.done_tx.clone();
                tokio::spawn(async move {
                    let _ = pipeline.await;
                    rollback_plugins(&plugins, &progress).await;
                    let _ = done_tx.send(true);
                });

                Err(e.into())
            }
        }
    }

    /// Suspend until an interrupt/terminate signal or the external close
    /// channel fires. Handlers are installed here and released on return.
    pub async fn wait(&self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt()).map_err(LifecycleError::Signal)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(LifecycleError::Signal)?;
        let mut shutdown = self.shutdown_rx.clone();

        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT received; shutting down");
            },
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down");
            },
            // a dropped close channel reads as a close request
            _ = shutdown.changed() => {
                info!("close requested; shutting down");
            },
        }
        Ok(())
    }

    /// Reverse-order close sweep across all plugins. Errors are aggregated,
    /// never aborting the sweep; repeated calls return the recorded
    /// aggregate without reinvoking plugins.
    pub async fn stop(&self) -> Result<()> {
        let _gate = self.stop_gate.lock().await;

        if let Some(recorded) = self.close_result.lock().clone() {
            if recorded.is_empty() {
                return Ok(());
            }
            return Err(LifecycleError::Close(recorded).into());
        }

        info!("stopping agent");
        self.state.store(STATE_CLOSED, Ordering::Release);

        let mut errors = CloseErrors::default();
        for plugin in self.plugins.iter().rev() {
            debug!("closing plugin {}", plugin.name());
            if let Err(e) = plugin.close().await {
                warn!("plugin {} failed to close: {}", plugin.name(), e);
                errors.push(plugin.name(), &e);
            }
        }

        *self.close_result.lock() = Some(errors.clone());
        let _ = self.done_tx.send(true);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Close(errors).into())
        }
    }

    /// Start, suspend on signal-or-close, stop.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        let wait_result = self.wait().await;
        let stop_result = self.stop().await;
        wait_result.and(stop_result)
    }

    /// Synchronous-path rollback for init/after-init failures: the pipeline
    /// has already returned, so every completed plugin can be closed before
    /// the error surfaces.
    async fn rollback_now(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        rollback_plugins(&self.plugins, &self.progress).await;
        *self.close_result.lock() = Some(CloseErrors::default());
        let _ = self.done_tx.send(true);
    }
}

async fn startup_pipeline(
    plugins: &PluginList,
    progress: &Mutex<StartupProgress>,
    cancel: &CancellationToken,
) -> Result<()> {
    for (index, plugin) in plugins.iter().enumerate() {
        if cancel.is_cancelled() {
            debug!("startup cancelled before {} initialized", plugin.name());
            return Ok(());
        }
        debug!("initializing plugin {}", plugin.name());
        plugin.init().await.map_err(|e| {
            Error::from(LifecycleError::Init {
                plugin: plugin.name().to_string(),
                source: Box::new(e),
            })
        })?;
        progress.lock().completed.push(index);
    }

    for plugin in plugins.iter() {
        if cancel.is_cancelled() {
            debug!("startup cancelled before {} ran after-init", plugin.name());
            return Ok(());
        }
        if let Some(post) = plugin.post_init() {
            debug!("running after-init for {}", plugin.name());
            post.after_init().await.map_err(|e| {
                Error::from(LifecycleError::PostInit {
                    plugin: plugin.name().to_string(),
                    source: Box::new(e),
                })
            })?;
        }
    }

    Ok(())
}

/// Close every plugin whose `init` completed, in reverse order. Secondary
/// close errors are logged, not surfaced; the original startup error stays
/// the one the caller sees.
async fn rollback_plugins(
    plugins: &PluginList,
    progress: &Mutex<StartupProgress>,
) {
    let completed = progress.lock().completed.clone();
    for index in completed.into_iter().rev() {
        if let Some(plugin) = plugins.get(index) {
            info!("rolling back plugin {}", plugin.name());
            if let Err(e) = plugin.close().await {
                warn!("close during rollback failed for {}: {}", plugin.name(), e);
            }
        }
    }
}
