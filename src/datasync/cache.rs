//! Last-revision cache: the broker-side memory of the most recent
//! (value, revision) seen per key.
//!
//! The sole source of `prev_value` for change events, and what lets the
//! broker suppress deletes of never-seen keys and byte-identical puts.
//! Revisions are stored opaquely; the broker compares, the cache does not.

use dashmap::DashMap;

use crate::KvPair;

#[derive(Debug, Default)]
pub struct RevisionCache {
    entries: DashMap<String, (Vec<u8>, i64)>,
}

impl RevisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the latest (value, revision) for `key`, returning the previous
    /// pair if one was cached.
    pub fn put_with_revision(
        &self,
        key: &str,
        value: Vec<u8>,
        revision: i64,
    ) -> Option<(Vec<u8>, i64)> {
        self.entries.insert(key.to_string(), (value, revision))
    }

    /// Remove `key`, returning the previous pair if one was cached.
    pub fn del(
        &self,
        key: &str,
    ) -> Option<(Vec<u8>, i64)> {
        self.entries.remove(key).map(|(_, pair)| pair)
    }

    /// Make the cache reflect a freshly listed snapshot of one prefix:
    /// entries under the prefix that the listing no longer contains are
    /// dropped, listed pairs are stored.
    pub(crate) fn refresh_prefix(
        &self,
        prefix: &str,
        pairs: &[KvPair],
    ) {
        self.entries.retain(|key, _| {
            !key.starts_with(prefix) || pairs.iter().any(|pair| pair.key == *key)
        });
        for pair in pairs {
            self.entries
                .insert(pair.key.clone(), (pair.value.clone(), pair.revision));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
