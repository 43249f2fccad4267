//! Gossip broadcasts of store updates.

use bytes::Bytes;
use smallvec::SmallVec;
use uuid::Uuid;

use super::update::{GossipMessage, Update};
use crate::broadcast::Broadcast;
use crate::error::Result;

#[cfg(feature = "metrics")]
use crate::metrics;

/// An encoded batch of updates waiting in the broadcast queue.
///
/// A broadcast invalidates a queued one when it touches every key the queued
/// one touches: the newer batch fully supersedes the older one on any node
/// that applies them in order.
#[derive(Debug)]
pub struct KvBroadcast {
    id: Uuid,
    keys: SmallVec<[String; 4]>,
    msg: Bytes,
    notify: Option<async_channel::Sender<()>>,
}

impl KvBroadcast {
    /// Encode `updates` into a tracked gossip payload under a fresh id.
    pub fn new(updates: Vec<Update>) -> Result<Self> {
        let keys = touched_keys(&updates);
        let id = Uuid::new_v4();
        let msg = GossipMessage::Tracked { id, updates }.encode()?;
        Ok(Self {
            id,
            keys,
            msg,
            notify: None,
        })
    }

    /// Wrap a tracked payload received from a peer. The sender's bytes are
    /// forwarded untouched.
    pub(crate) fn relay(id: Uuid, updates: &[Update], msg: Bytes) -> Self {
        Self {
            id,
            keys: touched_keys(updates),
            msg,
            notify: None,
        }
    }

    /// Attach a completion signal that is closed when the broadcast leaves
    /// the queue.
    pub fn with_notify(mut self, notify: async_channel::Sender<()>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Message id carried on the wire.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Keys touched by this broadcast, sorted.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

fn touched_keys(updates: &[Update]) -> SmallVec<[String; 4]> {
    let mut keys: SmallVec<[String; 4]> = updates
        .iter()
        .flat_map(|u| u.data.keys().cloned())
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

impl Broadcast for KvBroadcast {
    fn invalidates(&self, other: &Self) -> bool {
        !other.keys.is_empty()
            && other
                .keys
                .iter()
                .all(|k| self.keys.binary_search(k).is_ok())
    }

    fn message(&self) -> &Bytes {
        &self.msg
    }

    fn finished(&self) {
        #[cfg(feature = "metrics")]
        metrics::record_broadcast_retired();

        if let Some(notify) = &self.notify {
            notify.close();
        }
    }
}
