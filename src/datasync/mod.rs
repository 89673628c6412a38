//! The keyed data-change layer: event types, the last-revision cache, the
//! broker that mirrors the external store, and the resync orchestrator.

mod broker;
mod cache;
mod resync;
pub use broker::*;
pub use cache::*;
pub use resync::*;

#[cfg(test)]
mod resync_test;

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::KvPair;
use crate::Result;

/// Completion acknowledgement carried inside delivered events. The receiver
/// resolves it once processing finished; the sender awaits it with a bounded
/// timeout. Dropping an event unresolved reads as "subscriber gone" on the
/// sender side.
#[derive(Debug)]
pub struct DoneAck {
    tx: oneshot::Sender<Result<()>>,
}

impl DoneAck {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Signal successful processing.
    pub fn done(self) {
        let _ = self.tx.send(Ok(()));
    }

    /// Signal processing completion with an explicit outcome.
    pub fn done_with(
        self,
        result: Result<()>,
    ) {
        let _ = self.tx.send(result);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Delete,
}

/// One mutation observed on the external store, delivered to the single
/// subscription whose prefix set is the longest match for the key.
///
/// `prev_value` comes from the last-revision cache, never from the store;
/// a delete always carries the previously delivered value.
#[derive(Debug)]
pub struct ChangeEvent {
    pub key: String,
    pub kind: ChangeKind,
    /// Current value; `None` for deletes.
    pub value: Option<Vec<u8>>,
    pub prev_value: Option<Vec<u8>>,
    pub revision: i64,
    pub done: DoneAck,
}

/// Lazy per-prefix listing handed out inside a [`ResyncEvent`].
#[derive(Debug)]
pub struct KeyValIterator {
    inner: std::vec::IntoIter<KvPair>,
}

impl KeyValIterator {
    pub(crate) fn new(pairs: Vec<KvPair>) -> Self {
        Self {
            inner: pairs.into_iter(),
        }
    }
}

impl Iterator for KeyValIterator {
    type Item = KvPair;

    fn next(&mut self) -> Option<KvPair> {
        self.inner.next()
    }
}

/// A snapshot of every watched prefix, delivered before any change event at
/// startup and after every connection recovery.
#[derive(Debug)]
pub struct ResyncEvent {
    /// Prefix to listing, one entry per registered prefix.
    pub data: HashMap<String, KeyValIterator>,
    pub done: DoneAck,
}
