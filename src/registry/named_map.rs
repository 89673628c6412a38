//! A named, indexed in-memory mapping with change subscriptions.
//!
//! Primary keys are unique names; secondary indices are derived from the
//! stored value by a user-supplied extractor at insert time. Watch callbacks
//! run synchronously on the mutating thread, before the write lock is
//! released, so they must not call back into the mapping; subscribers that
//! need decoupling forward events through [`NamedMapping::watch_to_channel`].

use std::collections::HashMap;
use std::collections::HashSet;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::RegistryError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingChange {
    Put,
    Delete,
}

/// One mutation of the mapping, as seen by watch callbacks.
#[derive(Debug, Clone)]
pub struct MappingEvent<V> {
    pub name: String,
    pub old: Option<V>,
    pub new: Option<V>,
    pub kind: MappingChange,
}

/// Handle identifying a watch registration; pass back to
/// [`NamedMapping::unwatch`] to stop receiving callbacks.
#[derive(Debug)]
pub struct WatchHandle {
    id: u64,
}

type MetadataExtractor<V> = Box<dyn Fn(&V) -> Vec<(String, String)> + Send + Sync>;
type WatchCallback<V> = Box<dyn Fn(&MappingEvent<V>) + Send + Sync>;

struct MappingInner<V> {
    by_name: HashMap<String, V>,
    /// index name -> index key -> primary names
    secondary: HashMap<String, HashMap<String, HashSet<String>>>,
    watchers: Vec<(u64, WatchCallback<V>)>,
    next_watch_id: u64,
}

pub struct NamedMapping<V> {
    title: String,
    extractor: Option<MetadataExtractor<V>>,
    inner: RwLock<MappingInner<V>>,
}

impl<V: Clone> NamedMapping<V> {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            extractor: None,
            inner: RwLock::new(MappingInner {
                by_name: HashMap::new(),
                secondary: HashMap::new(),
                watchers: Vec::new(),
                next_watch_id: 0,
            }),
        }
    }

    /// A mapping with secondary indices derived by `extractor` from every
    /// inserted value.
    pub fn with_metadata(
        title: impl Into<String>,
        extractor: impl Fn(&V) -> Vec<(String, String)> + Send + Sync + 'static,
    ) -> Self {
        let mut mapping = Self::new(title);
        mapping.extractor = Some(Box::new(extractor));
        mapping
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Insert or replace. Replacement fires a change notification carrying
    /// the previous value.
    pub fn put(
        &self,
        name: &str,
        value: V,
    ) {
        let mut inner = self.inner.write();
        let old = inner.by_name.insert(name.to_string(), value.clone());

        if let Some(extractor) = &self.extractor {
            if let Some(old_value) = &old {
                remove_secondary(&mut inner.secondary, name, &extractor(old_value));
            }
            let derived = extractor(&value);
            for (index, key) in derived {
                inner
                    .secondary
                    .entry(index)
                    .or_default()
                    .entry(key)
                    .or_default()
                    .insert(name.to_string());
            }
        }

        fire(
            &inner,
            MappingEvent {
                name: name.to_string(),
                old,
                new: Some(value),
                kind: MappingChange::Put,
            },
        );
    }

    /// Remove; when present, fires a notification with the removed value as
    /// previous.
    pub fn delete(
        &self,
        name: &str,
    ) -> Option<V> {
        let mut inner = self.inner.write();
        let old = inner.by_name.remove(name)?;

        if let Some(extractor) = &self.extractor {
            remove_secondary(&mut inner.secondary, name, &extractor(&old));
        }

        fire(
            &inner,
            MappingEvent {
                name: name.to_string(),
                old: Some(old.clone()),
                new: None,
                kind: MappingChange::Delete,
            },
        );
        Some(old)
    }

    pub fn lookup(
        &self,
        name: &str,
    ) -> Option<V> {
        self.inner.read().by_name.get(name).cloned()
    }

    /// All names whose value maps `index` to `key`.
    ///
    /// # Errors
    /// `RegistryError::UnknownIndex` when the mapping carries no extractor.
    pub fn lookup_by_metadata(
        &self,
        index: &str,
        key: &str,
    ) -> Result<Vec<String>> {
        if self.extractor.is_none() {
            return Err(RegistryError::UnknownIndex(index.to_string()).into());
        }
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .secondary
            .get(index)
            .and_then(|by_key| by_key.get(key))
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    pub fn list_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a callback invoked on every subsequent mutation.
    pub fn watch(
        &self,
        callback: impl Fn(&MappingEvent<V>) + Send + Sync + 'static,
    ) -> WatchHandle {
        let mut inner = self.inner.write();
        let id = inner.next_watch_id;
        inner.next_watch_id += 1;
        inner.watchers.push((id, Box::new(callback)));
        WatchHandle { id }
    }

    pub fn unwatch(
        &self,
        handle: WatchHandle,
    ) {
        self.inner.write().watchers.retain(|(id, _)| *id != handle.id);
    }
}

impl<V: Clone + Send + 'static> NamedMapping<V> {
    /// The decoupling helper: mutations are forwarded into a channel the
    /// subscriber drains on its own schedule.
    pub fn watch_to_channel(&self) -> (WatchHandle, mpsc::UnboundedReceiver<MappingEvent<V>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.watch(move |event| {
            let _ = tx.send(event.clone());
        });
        (handle, rx)
    }
}

fn fire<V>(
    inner: &MappingInner<V>,
    event: MappingEvent<V>,
) {
    for (_, callback) in &inner.watchers {
        callback(&event);
    }
}

fn remove_secondary(
    secondary: &mut HashMap<String, HashMap<String, HashSet<String>>>,
    name: &str,
    derived: &[(String, String)],
) {
    for (index, key) in derived {
        if let Some(by_key) = secondary.get_mut(index) {
            if let Some(names) = by_key.get_mut(key) {
                names.remove(name);
                if names.is_empty() {
                    by_key.remove(key);
                }
            }
            if by_key.is_empty() {
                secondary.remove(index);
            }
        }
    }
}
