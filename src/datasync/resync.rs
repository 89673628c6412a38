//! Resync orchestration: broadcasts "resync started" pulses to registered
//! subjects and awaits their acknowledgement within a bounded window.
//!
//! Registration is a static operation performed only while the agent
//! initializes; registering a subject twice, or after the first pulse has
//! fired, is a programmer error and aborts the process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DoneAck;
use crate::DatasyncConfig;
use crate::Plugin;
use crate::Result;

const RESYNC_PLUGIN_NAME: &str = "resync";

/// A "resync started" pulse. The receiving subject performs its resync work
/// and acknowledges through `ack`/`ack_with`; listing failures travel back to
/// the orchestrator on this same path.
#[derive(Debug)]
pub struct StartedEvent {
    done: DoneAck,
}

impl StartedEvent {
    pub fn ack(self) {
        self.done.done();
    }

    pub fn ack_with(
        self,
        result: Result<()>,
    ) {
        self.done.done_with(result);
    }
}

/// Handle returned from [`ResyncOrchestrator::register`], owning the subject's
/// status channel.
pub struct Registration {
    subject: String,
    status_rx: mpsc::Receiver<StartedEvent>,
}

impl Registration {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next pulse, or `None` once the orchestrator is gone.
    pub async fn recv(&mut self) -> Option<StartedEvent> {
        self.status_rx.recv().await
    }
}

#[derive(Default)]
struct OrchestratorState {
    registrations: HashMap<String, mpsc::Sender<StartedEvent>>,
    /// Pulse order is registration order.
    order: Vec<String>,
    fired: bool,
}

/// Owns the registration map and drives resync pulses. Registered once in
/// the plugin list; the lifecycle engine triggers the first pulse after the
/// post-init phase completes, external callers may re-pulse at any time.
pub struct ResyncOrchestrator {
    state: Mutex<OrchestratorState>,
    done_timeout: Duration,
}

impl ResyncOrchestrator {
    pub fn new(config: &DatasyncConfig) -> Self {
        Self {
            state: Mutex::new(OrchestratorState::default()),
            done_timeout: config.resync_done_timeout(),
        }
    }

    /// Register a subject. Only valid during agent initialization.
    ///
    /// # Panics
    /// On a duplicate subject, or when called after the first pulse fired.
    pub fn register(
        &self,
        subject: &str,
    ) -> Registration {
        let mut state = self.state.lock();
        if state.fired {
            panic!("resync registration of {} after the first pulse", subject);
        }
        if state.registrations.contains_key(subject) {
            panic!("duplicate resync registration: {}", subject);
        }

        // capacity 1: a pulse parks until the subject's watcher picks it up;
        // ack observability comes from the event's oneshot
        let (tx, rx) = mpsc::channel(1);
        state.registrations.insert(subject.to_string(), tx);
        state.order.push(subject.to_string());

        debug!("resync subject registered: {}", subject);
        Registration {
            subject: subject.to_string(),
            status_rx: rx,
        }
    }

    /// Send one `Started` pulse to every registered subject, serially in
    /// registration order, waiting up to the configured bound for each
    /// acknowledgement. Timeouts and subject-reported errors are logged;
    /// neither fails the agent.
    pub async fn trigger_resync(&self) {
        let targets: Vec<(String, mpsc::Sender<StartedEvent>)> = {
            let mut state = self.state.lock();
            state.fired = true;
            state
                .order
                .iter()
                .filter_map(|subject| {
                    state
                        .registrations
                        .get(subject)
                        .map(|tx| (subject.clone(), tx.clone()))
                })
                .collect()
        };

        if targets.is_empty() {
            debug!("resync pulse with no registered subjects");
            return;
        }

        info!("resync started for {} subject(s)", targets.len());
        for (subject, tx) in targets {
            let (done, ack_rx) = DoneAck::new();
            let pulse = async {
                if tx.send(StartedEvent { done }).await.is_err() {
                    warn!(subject = %subject, "resync subject is gone; pulse skipped");
                    return;
                }
                match ack_rx.await {
                    Ok(Ok(())) => debug!(subject = %subject, "resync acknowledged"),
                    Ok(Err(e)) => warn!(subject = %subject, "resync failed: {}", e),
                    Err(_) => warn!(subject = %subject, "resync event dropped without ack"),
                }
            };
            if timeout(self.done_timeout, pulse).await.is_err() {
                warn!(
                    subject = %subject,
                    "no resync ack within {:?}; proceeding",
                    self.done_timeout
                );
            }
        }
    }
}

#[async_trait]
impl Plugin for ResyncOrchestrator {
    fn name(&self) -> &str {
        RESYNC_PLUGIN_NAME
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.registrations.clear();
        state.order.clear();
        Ok(())
    }
}
