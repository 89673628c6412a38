//! The external key-value collaborator surface the broker consumes.
//!
//! Exactly the four operations the datasync layer needs: prefix listing,
//! prefix watching, put and delete. No transactions at this level; concrete
//! transports implement [`KvClient`] elsewhere, the in-memory adaptor here
//! backs tests and the demo binary.

mod mem;
pub use mem::*;


use async_trait::async_trait;
use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;

use crate::Result;

/// One stored key with the revision the store assigned to its last write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: i64,
}

/// One event observed on a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvWatchEvent {
    Put(KvPair),
    Delete { key: String, revision: i64 },
}

impl KvWatchEvent {
    pub fn key(&self) -> &str {
        match self {
            KvWatchEvent::Put(pair) => &pair.key,
            KvWatchEvent::Delete { key, .. } => key,
        }
    }
}

pub type KvWatchStream = BoxStream<'static, KvWatchEvent>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KvClient: Send + Sync {
    /// All pairs whose key starts with `prefix`, in key order.
    async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<KvPair>>;

    /// Stream of events for keys under any of `prefixes`. The stream ends
    /// when the connection drops; callers reconnect by watching again.
    async fn watch(
        &self,
        prefixes: Vec<String>,
    ) -> Result<KvWatchStream>;

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> Result<()>;

    async fn delete(
        &self,
        key: &str,
    ) -> Result<()>;
}
