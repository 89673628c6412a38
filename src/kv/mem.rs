//! In-memory [`KvClient`] adaptor.
//!
//! Backs the unit tests and the demo binary. Revision numbers are a single
//! store-wide monotonic counter bumped on every write, matching the
//! semantics the broker expects from a real remote store.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::KvClient;
use super::KvPair;
use super::KvWatchEvent;
use super::KvWatchStream;
use crate::Result;

#[derive(Clone, Default)]
pub struct MemKvClient {
    inner: Arc<MemKvInner>,
}

#[derive(Default)]
struct MemKvInner {
    data: RwLock<BTreeMap<String, (Vec<u8>, i64)>>,
    revision: AtomicI64,
    watchers: Mutex<Vec<MemWatcher>>,
}

struct MemWatcher {
    prefixes: Vec<String>,
    tx: mpsc::UnboundedSender<KvWatchEvent>,
}

impl MemKvClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revision assigned to the most recent write.
    pub fn current_revision(&self) -> i64 {
        self.inner.revision.load(Ordering::Acquire)
    }

    /// Terminate every open watch stream, simulating a dropped connection.
    pub fn drop_watchers(&self) {
        self.inner.watchers.lock().clear();
    }

    fn publish(
        &self,
        event: KvWatchEvent,
    ) {
        let key = event.key().to_string();
        self.inner.watchers.lock().retain(|watcher| {
            if !watcher.prefixes.iter().any(|p| key.starts_with(p.as_str())) {
                return true;
            }
            // drop watchers whose receiver side is gone
            watcher.tx.send(event.clone()).is_ok()
        });
    }
}

#[async_trait]
impl KvClient for MemKvClient {
    async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<KvPair>> {
        let data = self.inner.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, revision))| KvPair {
                key: key.clone(),
                value: value.clone(),
                revision: *revision,
            })
            .collect())
    }

    async fn watch(
        &self,
        prefixes: Vec<String>,
    ) -> Result<KvWatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.watchers.lock().push(MemWatcher { prefixes, tx });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> Result<()> {
        let event = {
            let mut data = self.inner.data.write();
            let revision = self.inner.revision.fetch_add(1, Ordering::AcqRel) + 1;
            data.insert(key.to_string(), (value.clone(), revision));
            KvWatchEvent::Put(KvPair {
                key: key.to_string(),
                value,
                revision,
            })
        };
        self.publish(event);
        Ok(())
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        let event = {
            let mut data = self.inner.data.write();
            if data.remove(key).is_none() {
                return Ok(());
            }
            let revision = self.inner.revision.fetch_add(1, Ordering::AcqRel) + 1;
            KvWatchEvent::Delete {
                key: key.to_string(),
                revision,
            }
        };
        self.publish(event);
        Ok(())
    }
}
