//! Delegate wiring the store into the membership layer.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::broadcast::KvBroadcast;
use super::store::Store;
use super::update::{GossipMessage, Update};
use crate::broadcast::{Broadcast, TransmitLimitedQueue};
use crate::config::MergePolicy;
use crate::delegate::Delegate;
use crate::error::{Error, Result};

#[cfg(feature = "metrics")]
use crate::metrics;

/// How long a message id is remembered.
const SEEN_TTL: Duration = Duration::from_secs(60);

/// Upper bound on remembered message ids.
const SEEN_CAPACITY: usize = 8192;

/// Ids of recently handled gossip messages.
///
/// A node applies and relays each tracked message at most once per TTL,
/// which stops two conflicting writes from bouncing between nodes forever.
#[derive(Debug, Default)]
struct SeenIds {
    entries: HashSet<Uuid>,
    order: VecDeque<(Uuid, Instant)>,
}

impl SeenIds {
    /// Record `id`. Returns `true` the first time it is seen.
    fn insert(&mut self, id: Uuid, now: Instant) -> bool {
        self.evict(now);
        if !self.entries.insert(id) {
            return false;
        }
        self.order.push_back((id, now));
        true
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(id, first_seen)) = self.order.front() {
            let expired = now.saturating_duration_since(first_seen) >= SEEN_TTL;
            if !expired && self.order.len() < SEEN_CAPACITY {
                break;
            }
            self.order.pop_front();
            self.entries.remove(&id);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// [`Delegate`] backed by a [`Store`] and a queue of [`KvBroadcast`]s.
///
/// - Tracked gossip payloads are applied to the store and relayed once per
///   message id. Untracked (`d`) payloads are applied but never relayed.
/// - Push/pull carries the full store as a JSON object; non-join merges
///   follow the configured [`MergePolicy`].
pub struct KvDelegate {
    store: Arc<Store>,
    broadcasts: Arc<TransmitLimitedQueue<KvBroadcast>>,
    merge_policy: MergePolicy,
    max_payload: usize,
    seen: Mutex<SeenIds>,
    /// Held across apply + enqueue so the queue sees changes in store order.
    ordering: Mutex<()>,
}

impl std::fmt::Debug for KvDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvDelegate")
            .field("keys", &self.store.len())
            .field("queued", &self.broadcasts.num_queued())
            .field("merge_policy", &self.merge_policy)
            .field("max_payload", &self.max_payload)
            .finish()
    }
}

impl KvDelegate {
    /// Create a delegate over `store`, gossiping through `broadcasts`.
    pub fn new(
        store: Arc<Store>,
        broadcasts: Arc<TransmitLimitedQueue<KvBroadcast>>,
        merge_policy: MergePolicy,
    ) -> Self {
        Self {
            store,
            broadcasts,
            merge_policy,
            max_payload: usize::MAX,
            seen: Mutex::new(SeenIds::default()),
            ordering: Mutex::new(()),
        }
    }

    /// Largest payload this delegate will gossip (builder pattern).
    ///
    /// Anything bigger could never be piggybacked and would sit in the
    /// queue forever.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Largest payload this delegate will gossip.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Apply a local change and queue it for gossip.
    ///
    /// The change is encoded and size-checked first; nothing is applied if
    /// either step fails. `notify` is closed once the broadcast leaves the
    /// queue.
    pub fn submit_local(
        &self,
        updates: Vec<Update>,
        notify: Option<async_channel::Sender<()>>,
    ) -> Result<()> {
        let mut broadcast = KvBroadcast::new(updates.clone())?;
        let size = broadcast.message().len();
        if size > self.max_payload {
            return Err(Error::MessageTooLarge {
                size,
                max_size: self.max_payload,
            });
        }
        if let Some(notify) = notify {
            broadcast = broadcast.with_notify(notify);
        }

        let _ordering = self.ordering.lock();
        self.store.apply_updates(&updates);
        self.seen.lock().insert(broadcast.id(), Instant::now());
        self.queue(broadcast);
        Ok(())
    }

    /// Number of store broadcasts waiting to be gossiped.
    pub fn num_queued(&self) -> usize {
        self.broadcasts.num_queued()
    }

    /// Number of message ids currently remembered.
    pub fn num_seen(&self) -> usize {
        self.seen.lock().len()
    }

    fn queue(&self, broadcast: KvBroadcast) {
        #[cfg(feature = "metrics")]
        metrics::record_broadcast_queued();
        self.broadcasts.queue_broadcast(broadcast);
    }
}

impl Delegate for KvDelegate {
    fn notify_msg(&self, msg: Bytes) {
        if msg.is_empty() {
            return;
        }

        let (id, updates) = match GossipMessage::decode(&msg) {
            Ok(GossipMessage::Data(updates)) => (None, updates),
            Ok(GossipMessage::Tracked { id, updates }) => (Some(id), updates),
            Err(e) => {
                #[cfg(feature = "metrics")]
                metrics::record_malformed();
                tracing::debug!(len = msg.len(), "dropping gossip payload: {}", e);
                return;
            }
        };

        let _ordering = self.ordering.lock();
        if let Some(id) = id {
            if !self.seen.lock().insert(id, Instant::now()) {
                tracing::trace!(%id, "ignoring already handled gossip");
                return;
            }
        }

        let applied = self.store.apply_updates(&updates);
        tracing::trace!(?id, updates = updates.len(), keys = applied, "applied gossip updates");

        #[cfg(feature = "metrics")]
        {
            metrics::record_updates_applied(updates.len());
            metrics::set_store_keys(self.store.len());
        }

        match id {
            Some(id) if msg.len() <= self.max_payload => {
                self.queue(KvBroadcast::relay(id, &updates, msg));
            }
            Some(id) => {
                tracing::debug!(%id, len = msg.len(), "gossip payload too large to relay");
            }
            None => {}
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
        self.broadcasts.get_broadcasts(overhead, limit)
    }

    fn local_state(&self, _join: bool) -> Bytes {
        match self.store.local_state() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("failed to encode local state: {}", e);
                Bytes::new()
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if buf.is_empty() {
            return;
        }
        if !join && self.merge_policy == MergePolicy::JoinOnly {
            tracing::trace!("skipping non-join state merge");
            return;
        }

        match self.store.merge_remote_state(buf) {
            Ok(merged) => {
                tracing::debug!(merged, join, "merged remote state");
                #[cfg(feature = "metrics")]
                metrics::set_store_keys(self.store.len());
            }
            Err(e) => {
                #[cfg(feature = "metrics")]
                metrics::record_malformed();
                tracing::debug!(len = buf.len(), "dropping remote state: {}", e);
            }
        }
    }
}
