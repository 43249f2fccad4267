//! The replicated key-value mapping.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::update::{Action, Update};
use crate::error::Result;

/// In-memory string mapping with last-write-wins semantics.
///
/// Every update is applied unconditionally in arrival order. There are no
/// versions, so two nodes writing the same key concurrently may end up
/// keeping different values until a later write or an anti-entropy merge.
#[derive(Debug, Default)]
pub struct Store {
    items: RwLock<HashMap<String, String>>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one update. Returns the number of keys it touched.
    pub fn apply_update(&self, update: &Update) -> usize {
        let mut items = self.items.write();
        apply_locked(&mut items, update)
    }

    /// Apply a batch of updates in order under a single write lock.
    pub fn apply_updates(&self, updates: &[Update]) -> usize {
        let mut items = self.items.write();
        updates.iter().map(|u| apply_locked(&mut items, u)).sum()
    }

    /// Read a key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Sorted copy of the whole mapping.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.items
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Full state as a JSON object.
    pub fn local_state(&self) -> Result<Bytes> {
        let items = self.items.read();
        Ok(Bytes::from(serde_json::to_vec(&*items)?))
    }

    /// Merge a JSON object produced by [`local_state`](Store::local_state).
    ///
    /// Remote values overwrite local ones key by key; local keys missing from
    /// the snapshot are kept. An empty buffer merges nothing. The payload is
    /// decoded completely before the store is touched. Returns the number of
    /// keys merged.
    pub fn merge_remote_state(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let remote: HashMap<String, String> = serde_json::from_slice(buf)?;
        let merged = remote.len();
        self.items.write().extend(remote);
        Ok(merged)
    }
}

fn apply_locked(items: &mut HashMap<String, String>, update: &Update) -> usize {
    match update.action {
        Action::Add => {
            for (k, v) in &update.data {
                items.insert(k.clone(), v.clone());
            }
            update.data.len()
        }
        Action::Del => {
            for k in update.data.keys() {
                items.remove(k);
            }
            update.data.len()
        }
        Action::Unknown => 0,
    }
}
