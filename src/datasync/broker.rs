//! The keyed data-change broker.
//!
//! Mirrors the agent-scoped slice of the external key-value store into the
//! last-revision cache and fans change notifications out to subscribers.
//! Subscriptions are accepted while the agent initializes; the after-init
//! phase performs the initial catch-up, wires the per-subscription resync
//! watchers, and starts the change watcher. From then on the broker also
//! accepts publications.
//!
//! Delivery contract: within one subscription, change events arrive in store
//! order; change delivery is deliberately lossy under sink pressure, resync
//! delivery is not. A change observed before a subscription's first resync
//! snapshot is subsumed by that snapshot rather than delivered twice.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::cache::RevisionCache;
use super::resync::Registration;
use super::resync::ResyncOrchestrator;
use super::ChangeEvent;
use super::ChangeKind;
use super::DoneAck;
use super::KeyValIterator;
use super::ResyncEvent;
use crate::DatasyncConfig;
use crate::DatasyncError;
use crate::KvClient;
use crate::KvPair;
use crate::KvWatchEvent;
use crate::Plugin;
use crate::PostInitPlugin;
use crate::Result;

const BROKER_PLUGIN_NAME: &str = "kvdbsync";

/// Broker phases; transitions are one-way.
const PHASE_REGISTERING: u8 = 0;
const PHASE_SYNCING: u8 = 1;
const PHASE_READY: u8 = 2;
const PHASE_CLOSED: u8 = 3;

pub(crate) struct Subscription {
    subject: String,
    change_tx: mpsc::Sender<ChangeEvent>,
    resync_tx: mpsc::Sender<ResyncEvent>,
    /// Normalized to a leading slash; relative to the agent prefix.
    prefixes: Vec<String>,
    /// Set once the first resync cycle reached this subscription. Changes
    /// observed earlier are subsumed by the pending snapshot.
    active: AtomicBool,
}

impl Subscription {
    /// Length of the longest registered prefix matching `key`, if any.
    fn match_len(
        &self,
        key: &str,
    ) -> Option<usize> {
        self.prefixes
            .iter()
            .filter(|p| key.starts_with(p.as_str()))
            .map(|p| p.len())
            .max()
    }
}

/// Handle acknowledging that a subscription's sinks are wired to the broker;
/// pass back to [`KvBroker::unwatch`] to destroy the subscription.
#[derive(Debug)]
pub struct WatchRegistration {
    subject: String,
}

impl WatchRegistration {
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// The datasync broker plugin.
pub struct KvBroker {
    kv: Arc<dyn KvClient>,
    orchestrator: Arc<ResyncOrchestrator>,
    config: DatasyncConfig,
    cache: Arc<RevisionCache>,
    subscriptions: Arc<ArcSwap<Vec<Arc<Subscription>>>>,
    phase: AtomicU8,
    cancel: CancellationToken,
}

impl KvBroker {
    pub fn new(
        kv: Arc<dyn KvClient>,
        orchestrator: Arc<ResyncOrchestrator>,
        config: DatasyncConfig,
    ) -> Self {
        Self {
            kv,
            orchestrator,
            config,
            cache: Arc::new(RevisionCache::new()),
            subscriptions: Arc::new(ArcSwap::from_pointee(Vec::new())),
            phase: AtomicU8::new(PHASE_REGISTERING),
            cancel: CancellationToken::new(),
        }
    }

    /// Capacity subscribers should give their change sinks.
    pub fn change_sink_capacity(&self) -> usize {
        self.config.change_sink_capacity
    }

    /// Register interest in a set of key prefixes. Only valid before the
    /// broker enters its after-init phase.
    ///
    /// # Panics
    /// On a duplicate subject; subject names identify subscriptions and
    /// reusing one is a programmer error.
    pub fn watch(
        &self,
        subject: &str,
        change_tx: mpsc::Sender<ChangeEvent>,
        resync_tx: mpsc::Sender<ResyncEvent>,
        prefixes: Vec<String>,
    ) -> Result<WatchRegistration> {
        if self.phase.load(Ordering::Acquire) != PHASE_REGISTERING {
            return Err(DatasyncError::WatchAfterInit.into());
        }
        if self
            .subscriptions
            .load()
            .iter()
            .any(|sub| sub.subject == subject)
        {
            panic!("duplicate datasync subscription: {}", subject);
        }

        let prefixes: Vec<String> = prefixes.into_iter().map(|p| normalize_prefix(&p)).collect();
        info!(subject = %subject, ?prefixes, "datasync subscription registered");

        let subscription = Arc::new(Subscription {
            subject: subject.to_string(),
            change_tx,
            resync_tx,
            prefixes,
            active: AtomicBool::new(false),
        });
        self.subscriptions.rcu(|subs| {
            let mut next = Vec::with_capacity(subs.len() + 1);
            next.extend(subs.iter().cloned());
            next.push(subscription.clone());
            next
        });

        Ok(WatchRegistration {
            subject: subject.to_string(),
        })
    }

    /// Destroy a subscription: its change events stop routing immediately.
    pub fn unwatch(
        &self,
        registration: WatchRegistration,
    ) {
        info!(subject = %registration.subject, "datasync subscription unregistered");
        self.subscriptions.rcu(|subs| {
            subs.iter()
                .filter(|sub| sub.subject != registration.subject)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    /// Write an agent-scoped key to the external store. Only valid after the
    /// broker completed after-init.
    pub async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> Result<()> {
        self.ensure_ready()?;
        self.kv.put(&self.full_key(key), value).await
    }

    /// Delete an agent-scoped key from the external store. Only valid after
    /// the broker completed after-init.
    pub async fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        self.ensure_ready()?;
        self.kv.delete(&self.full_key(key)).await
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.phase.load(Ordering::Acquire) != PHASE_READY {
            return Err(DatasyncError::PutBeforeReady.into());
        }
        Ok(())
    }

    fn full_key(
        &self,
        relative: &str,
    ) -> String {
        format!(
            "{}{}",
            self.config.agent_prefix(),
            relative.trim_start_matches('/')
        )
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &RevisionCache {
        &self.cache
    }

    /// Initial catch-up: populate the cache from a listing of every
    /// registered prefix without delivering change events.
    async fn catch_up(
        &self,
        subs: &[Arc<Subscription>],
    ) -> Result<()> {
        let agent_prefix = self.config.agent_prefix();
        for sub in subs {
            for prefix in &sub.prefixes {
                let pairs = list_relative(&*self.kv, &agent_prefix, prefix).await?;
                debug!(
                    subject = %sub.subject,
                    prefix = %prefix,
                    "catch-up listed {} pair(s)",
                    pairs.len()
                );
                for pair in pairs {
                    self.cache
                        .put_with_revision(&pair.key, pair.value, pair.revision);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for KvBroker {
    fn name(&self) -> &str {
        BROKER_PLUGIN_NAME
    }

    async fn init(&self) -> Result<()> {
        // subscriptions arrive while dependent plugins initialize
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.phase.store(PHASE_CLOSED, Ordering::Release);
        self.cancel.cancel();
        self.subscriptions.store(Arc::new(Vec::new()));
        Ok(())
    }
}

#[async_trait]
impl PostInitPlugin for KvBroker {
    async fn after_init(&self) -> Result<()> {
        self.phase.store(PHASE_SYNCING, Ordering::Release);
        let subs = self.subscriptions.load_full();

        // 1. initial catch-up, no event delivery
        self.catch_up(&subs).await?;

        // 2. one resync watcher per subscription
        for sub in subs.iter() {
            let registration = self.orchestrator.register(&sub.subject);
            tokio::spawn(resync_watcher(
                self.kv.clone(),
                self.cache.clone(),
                self.config.clone(),
                sub.clone(),
                registration,
                self.cancel.clone(),
            ));
        }

        // 3. the change watcher over the union of prefixes
        let mut union: Vec<String> = subs
            .iter()
            .flat_map(|sub| sub.prefixes.iter())
            .map(|p| format!("{}{}", self.config.agent_prefix(), p.trim_start_matches('/')))
            .collect();
        union.sort();
        union.dedup();
        if !union.is_empty() {
            tokio::spawn(change_watcher(
                self.kv.clone(),
                self.cache.clone(),
                self.config.clone(),
                self.subscriptions.clone(),
                self.orchestrator.clone(),
                union,
                self.cancel.clone(),
            ));
        }

        self.phase.store(PHASE_READY, Ordering::Release);
        Ok(())
    }
}

fn normalize_prefix(prefix: &str) -> String {
    format!("/{}", prefix.trim_start_matches('/'))
}

/// Translate a store key back into the agent-relative form subscribers use.
fn relative_key(
    agent_prefix: &str,
    full_key: &str,
) -> Option<String> {
    full_key
        .strip_prefix(agent_prefix)
        .map(|rest| format!("/{}", rest))
}

/// List one relative prefix from the store, translating keys back to the
/// relative form.
async fn list_relative(
    kv: &dyn KvClient,
    agent_prefix: &str,
    prefix: &str,
) -> Result<Vec<KvPair>> {
    let full_prefix = format!("{}{}", agent_prefix, prefix.trim_start_matches('/'));
    let pairs = kv.list(&full_prefix).await.map_err(|e| DatasyncError::ResyncList {
        prefix: prefix.to_string(),
        source: Box::new(e),
    })?;
    Ok(pairs
        .into_iter()
        .filter_map(|pair| {
            relative_key(agent_prefix, &pair.key).map(|key| KvPair {
                key,
                value: pair.value,
                revision: pair.revision,
            })
        })
        .collect())
}

/// Per-subscription loop that answers the orchestrator's pulses.
async fn resync_watcher(
    kv: Arc<dyn KvClient>,
    cache: Arc<RevisionCache>,
    config: DatasyncConfig,
    sub: Arc<Subscription>,
    mut registration: Registration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            started = registration.recv() => {
                let Some(started) = started else { break };
                match resync_cycle(&*kv, &cache, &config, &sub).await {
                    Ok(()) => started.ack(),
                    Err(e) => {
                        warn!(subject = %sub.subject, "resync cycle failed: {}", e);
                        started.ack_with(Err(e));
                    }
                }
            }
        }
    }
    debug!(subject = %sub.subject, "resync watcher stopped");
}

/// One resync cycle: list every prefix, refresh the cache to the snapshot,
/// deliver a [`ResyncEvent`] and wait for the subscriber's acknowledgement.
///
/// An unaccepted event (accept timeout, closed sink) skips the subscription
/// for this cycle only; a listing failure travels back on the ack path.
async fn resync_cycle(
    kv: &dyn KvClient,
    cache: &RevisionCache,
    config: &DatasyncConfig,
    sub: &Subscription,
) -> Result<()> {
    let agent_prefix = config.agent_prefix();

    let mut data = HashMap::new();
    for prefix in &sub.prefixes {
        let pairs = list_relative(kv, &agent_prefix, prefix).await?;
        cache.refresh_prefix(prefix, &pairs);
        data.insert(prefix.clone(), KeyValIterator::new(pairs));
    }

    let (done, ack_rx) = DoneAck::new();
    let event = ResyncEvent { data, done };

    match timeout(config.resync_accept_timeout(), sub.resync_tx.send(event)).await {
        Err(_) => {
            let busy = DatasyncError::SubscriptionBusy {
                subject: sub.subject.clone(),
                timeout: config.resync_accept_timeout(),
            };
            warn!("resync skipped for this cycle: {}", busy);
            sub.active.store(true, Ordering::Release);
            return Ok(());
        }
        Ok(Err(_)) => {
            warn!(subject = %sub.subject, "resync sink closed; skipping this cycle");
            sub.active.store(true, Ordering::Release);
            return Ok(());
        }
        Ok(Ok(())) => {}
    }
    sub.active.store(true, Ordering::Release);

    match timeout(config.resync_done_timeout(), ack_rx).await {
        Ok(Ok(Ok(()))) => {
            debug!(subject = %sub.subject, "resync processed");
            Ok(())
        }
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_)) => {
            warn!(subject = %sub.subject, "resync event dropped without ack");
            Ok(())
        }
        Err(_) => {
            warn!(
                subject = %sub.subject,
                "no resync ack within {:?}; proceeding",
                config.resync_done_timeout()
            );
            Ok(())
        }
    }
}

/// The broker's single change watcher: consumes the store's watch stream,
/// translates events against the cache, and routes them. Reconnects with
/// exponential backoff when the stream drops, then issues a resync pulse so
/// subscribers re-converge.
async fn change_watcher(
    kv: Arc<dyn KvClient>,
    cache: Arc<RevisionCache>,
    config: DatasyncConfig,
    subscriptions: Arc<ArcSwap<Vec<Arc<Subscription>>>>,
    orchestrator: Arc<ResyncOrchestrator>,
    prefixes: Vec<String>,
    cancel: CancellationToken,
) {
    let agent_prefix = config.agent_prefix();
    let mut reconnecting = false;
    let mut delay = config.reconnect_initial_delay();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let mut stream = match kv.watch(prefixes.clone()).await {
            Ok(stream) => {
                delay = config.reconnect_initial_delay();
                stream
            }
            Err(e) => {
                warn!("watch connect failed: {}; retrying in {:?}", e, delay);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
                delay = (delay * 2).min(config.reconnect_max_delay());
                continue;
            }
        };

        if reconnecting {
            info!("watch stream re-established; issuing resync pulse");
            orchestrator.trigger_resync().await;
        }
        reconnecting = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = stream.next() => {
                    let Some(event) = event else { break };
                    let subs = subscriptions.load_full();
                    handle_store_event(&cache, &config, &subs, &agent_prefix, event).await;
                }
            }
        }

        warn!("watch stream closed; reconnecting in {:?}", delay);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
        delay = (delay * 2).min(config.reconnect_max_delay());
    }
    debug!("change watcher stopped");
}

/// Translate one store event against the cache and deliver it to the
/// longest-prefix-matching subscription.
async fn handle_store_event(
    cache: &RevisionCache,
    config: &DatasyncConfig,
    subs: &[Arc<Subscription>],
    agent_prefix: &str,
    event: KvWatchEvent,
) {
    let Some(key) = relative_key(agent_prefix, event.key()) else {
        trace!(key = %event.key(), "event outside the agent scope dropped");
        return;
    };

    let change = match event {
        KvWatchEvent::Put(pair) => {
            let prev = cache.put_with_revision(&key, pair.value.clone(), pair.revision);
            if let Some((prev_value, _)) = &prev {
                if *prev_value == pair.value {
                    trace!(key = %key, "redundant put dropped");
                    return;
                }
            }
            PendingChange {
                key,
                kind: ChangeKind::Put,
                value: Some(pair.value),
                prev_value: prev.map(|(value, _)| value),
                revision: pair.revision,
            }
        }
        KvWatchEvent::Delete { revision, .. } => {
            let Some((prev_value, _)) = cache.del(&key) else {
                trace!(key = %key, "delete of unseen key dropped");
                return;
            };
            PendingChange {
                key,
                kind: ChangeKind::Delete,
                value: None,
                prev_value: Some(prev_value),
                revision,
            }
        }
    };

    route_change(config, subs, change).await;
}

struct PendingChange {
    key: String,
    kind: ChangeKind,
    value: Option<Vec<u8>>,
    prev_value: Option<Vec<u8>>,
    revision: i64,
}

async fn route_change(
    config: &DatasyncConfig,
    subs: &[Arc<Subscription>],
    change: PendingChange,
) {
    let Some(sub) = subs
        .iter()
        .filter_map(|sub| sub.match_len(&change.key).map(|len| (len, sub)))
        .max_by_key(|(len, _)| *len)
        .map(|(_, sub)| sub)
    else {
        trace!(key = %change.key, "no subscription matches; event dropped");
        return;
    };

    if !sub.active.load(Ordering::Acquire) {
        trace!(
            subject = %sub.subject,
            key = %change.key,
            "change before first resync; subsumed by the pending snapshot"
        );
        return;
    }

    let (done, ack_rx) = DoneAck::new();
    let event = ChangeEvent {
        key: change.key.clone(),
        kind: change.kind,
        value: change.value,
        prev_value: change.prev_value,
        revision: change.revision,
        done,
    };

    match timeout(config.change_send_timeout(), sub.change_tx.send(event)).await {
        Err(_) => {
            // deliberate lossy-under-pressure for change events
            let busy = DatasyncError::SubscriptionBusy {
                subject: sub.subject.clone(),
                timeout: config.change_send_timeout(),
            };
            warn!(key = %change.key, "change event dropped: {}", busy);
        }
        Ok(Err(_)) => {
            warn!(subject = %sub.subject, key = %change.key, "change sink closed; event dropped");
        }
        Ok(Ok(())) => {
            let subject = sub.subject.clone();
            let key = change.key;
            tokio::spawn(async move {
                if let Ok(Err(e)) = ack_rx.await {
                    warn!(subject = %subject, key = %key, "subscriber failed to process change: {}", e);
                }
            });
        }
    }
}
