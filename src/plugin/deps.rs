//! Dependency discovery: turns a user-assembled aggregate into the ordered,
//! deduplicated plugin list the lifecycle engine drives.

use std::collections::HashSet;

use crate::Error;
use crate::PluginHandle;
use crate::Result;

/// An ordered sequence of plugins, leaves before roots.
///
/// Invariants: no duplicate instances; if plugin P is reachable through
/// `dependencies()` from plugin Q, then P precedes Q; the aggregate the list
/// was discovered from is last.
#[derive(Clone, Debug, Default)]
pub struct PluginList(Vec<PluginHandle>);

impl PluginList {
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &PluginHandle> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(
        &self,
        index: usize,
    ) -> Option<&PluginHandle> {
        self.0.get(index)
    }

    /// Names in initialization order, mostly for logs and assertions.
    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|h| h.name().to_string()).collect()
    }
}

/// Walk the aggregate's dependency graph post-order and return the plugins
/// in dependency order.
///
/// Deduplication is by instance identity and the first emission wins, so a
/// plugin shared between two parents keeps the name it was first declared
/// under. The aggregate itself is appended last.
///
/// # Errors
/// `Error::Fatal` on a dependency cycle. The declared-dependency walk can
/// express cycles where a field traversal could not, so the discoverer must
/// refuse rather than recurse forever.
pub fn discover(aggregate: &PluginHandle) -> Result<PluginList> {
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut ordered = Vec::new();

    visit(aggregate, &mut visited, &mut on_stack, &mut ordered)?;

    Ok(PluginList(ordered))
}

fn visit(
    handle: &PluginHandle,
    visited: &mut HashSet<usize>,
    on_stack: &mut HashSet<usize>,
    ordered: &mut Vec<PluginHandle>,
) -> Result<()> {
    let id = handle.instance_id();
    if visited.contains(&id) {
        return Ok(());
    }
    if !on_stack.insert(id) {
        return Err(Error::Fatal(format!(
            "plugin dependency cycle through {}",
            handle.name()
        )));
    }

    for dep in handle.dependencies() {
        visit(&dep, visited, on_stack, ordered)?;
    }

    on_stack.remove(&id);
    visited.insert(id);
    ordered.push(handle.clone());

    Ok(())
}
