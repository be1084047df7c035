//! Live-query listener bookkeeping.
//!
//! Every listener owns the resource tags its last call produced. A set of
//! updated patterns selects the listeners to refresh; a listener whose tags
//! match several patterns is refreshed once.

use futures::future::BoxFuture;
use kite_core::matches;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

pub(crate) type ListenerId = u64;

/// Re-runs a listener's call and hands the result to its callback.
pub(crate) type Refresh = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct ListenerEntry {
    tags: Vec<String>,
    remote: bool,
    refresh: Refresh,
}

#[derive(Default)]
pub(crate) struct ListenerTable {
    next_id: ListenerId,
    listeners: HashMap<ListenerId, ListenerEntry>,
    by_tag: HashMap<String, HashSet<ListenerId>>,
}

impl ListenerTable {
    pub fn register(&mut self, tags: Vec<String>, remote: bool, refresh: Refresh) -> ListenerId {
        self.next_id += 1;
        let id = self.next_id;
        for tag in &tags {
            self.by_tag.entry(tag.clone()).or_default().insert(id);
        }
        self.listeners.insert(id, ListenerEntry { tags, remote, refresh });
        id
    }

    /// Remove one listener. Returns the tags no remote listener still wants,
    /// or `None` if the listener was already gone.
    pub fn remove(&mut self, id: ListenerId) -> Option<Vec<String>> {
        let entry = self.listeners.remove(&id)?;
        for tag in &entry.tags {
            if let Some(ids) = self.by_tag.get_mut(tag) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        if !entry.remote {
            return Some(Vec::new());
        }
        let released = entry
            .tags
            .into_iter()
            .filter(|tag| !self.has_remote_listener(tag))
            .collect();
        Some(released)
    }

    fn has_remote_listener(&self, tag: &str) -> bool {
        self.by_tag.get(tag).is_some_and(|ids| {
            ids.iter()
                .any(|id| self.listeners.get(id).is_some_and(|entry| entry.remote))
        })
    }

    /// Refresh functions of every listener holding a tag matched by any pattern.
    pub fn matching(&self, patterns: &[String]) -> Vec<Refresh> {
        let ids: BTreeSet<ListenerId> = self
            .by_tag
            .iter()
            .filter(|(tag, _)| patterns.iter().any(|p| matches(p, tag)))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        ids.iter()
            .filter_map(|id| self.listeners.get(id))
            .map(|entry| entry.refresh.clone())
            .collect()
    }

    /// Every tag some remote listener wants, deduplicated.
    pub fn remote_tags(&self) -> Vec<String> {
        let tags: BTreeSet<&String> = self
            .listeners
            .values()
            .filter(|entry| entry.remote)
            .flat_map(|entry| entry.tags.iter())
            .collect();
        tags.into_iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}
