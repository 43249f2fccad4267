//! Transmit-limited broadcast queue.
//!
//! Pending gossip is piggybacked onto outgoing packets a bounded number of
//! times. Each queued broadcast tracks how often it has been handed out; once
//! it has been selected `retransmit_limit` times it is retired and its
//! [`Broadcast::finished`] hook fires.
//!
//! # Ordering
//!
//! Broadcasts are selected in this order:
//! 1. Fewest transmissions so far
//! 2. Larger messages first (so small ones fill the remaining space)
//! 3. Newest first

use bytes::Bytes;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// A message that can be queued for gossip.
pub trait Broadcast: Send + Sync + 'static {
    /// Whether enqueueing `self` makes the queued `other` obsolete.
    fn invalidates(&self, other: &Self) -> bool;

    /// The encoded message to piggyback.
    fn message(&self) -> &Bytes;

    /// Called once when the broadcast leaves the queue, either because it
    /// reached its retransmit limit or because it was invalidated.
    fn finished(&self) {}
}

/// Number of times a broadcast is transmitted in a cluster of `num_nodes`.
///
/// `ceil(retransmit_mult * ln(num_nodes + 1))`.
pub fn retransmit_limit(retransmit_mult: usize, num_nodes: usize) -> usize {
    let node_scale = ((num_nodes + 1) as f64).ln();
    (retransmit_mult as f64 * node_scale).ceil() as usize
}

/// (transmits, larger first, newer first)
type QueueKey = (usize, Reverse<usize>, Reverse<u64>);

struct QueueState<B> {
    items: BTreeMap<QueueKey, B>,
    next_id: u64,
}

/// Queue of broadcasts bounded by a cluster-size-dependent retransmit limit.
pub struct TransmitLimitedQueue<B> {
    retransmit_mult: usize,
    num_nodes: Box<dyn Fn() -> usize + Send + Sync>,
    state: Mutex<QueueState<B>>,
}

impl<B> std::fmt::Debug for TransmitLimitedQueue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmitLimitedQueue")
            .field("retransmit_mult", &self.retransmit_mult)
            .field("queued", &self.state.lock().items.len())
            .finish()
    }
}

impl<B: Broadcast> TransmitLimitedQueue<B> {
    /// Create a queue.
    ///
    /// `num_nodes` is consulted on every selection round, before the queue
    /// lock is taken, so it may read other shared state freely.
    pub fn new(retransmit_mult: usize, num_nodes: impl Fn() -> usize + Send + Sync + 'static) -> Self {
        Self {
            retransmit_mult,
            num_nodes: Box::new(num_nodes),
            state: Mutex::new(QueueState {
                items: BTreeMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Enqueue a broadcast, dropping any queued broadcast it invalidates.
    pub fn queue_broadcast(&self, broadcast: B) {
        let invalidated = {
            let mut state = self.state.lock();
            let stale: Vec<QueueKey> = state
                .items
                .iter()
                .filter(|(_, queued)| broadcast.invalidates(queued))
                .map(|(key, _)| *key)
                .collect();
            let invalidated: Vec<B> = stale
                .into_iter()
                .filter_map(|key| state.items.remove(&key))
                .collect();

            let id = state.next_id;
            state.next_id += 1;
            let key = (0, Reverse(broadcast.message().len()), Reverse(id));
            state.items.insert(key, broadcast);
            invalidated
        };

        for b in invalidated {
            b.finished();
        }
    }

    /// Select broadcasts for one outgoing packet.
    ///
    /// Each selected message costs `overhead + message.len()` bytes out of
    /// `limit`. Messages that do not fit are skipped in favour of smaller ones.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes> {
        let transmit_limit = retransmit_limit(self.retransmit_mult, (self.num_nodes)());

        let mut selected = Vec::new();
        let retired = {
            let mut state = self.state.lock();
            if state.items.is_empty() {
                return selected;
            }

            let mut used = 0;
            let mut picked: Vec<QueueKey> = Vec::new();
            for (key, b) in state.items.iter() {
                let cost = overhead + b.message().len();
                if used + cost > limit {
                    continue;
                }
                used += cost;
                picked.push(*key);
                if limit - used <= overhead {
                    break;
                }
            }

            let mut retired = Vec::new();
            for key in picked {
                let Some(b) = state.items.remove(&key) else {
                    continue;
                };
                selected.push(b.message().clone());
                let (transmits, len, id) = key;
                let transmits = transmits + 1;
                if transmits >= transmit_limit {
                    retired.push(b);
                } else {
                    state.items.insert((transmits, len, id), b);
                }
            }
            retired
        };

        for b in retired {
            b.finished();
        }
        selected
    }

    /// Number of queued broadcasts.
    pub fn num_queued(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Keep at most `max_retain` broadcasts, dropping the most transmitted.
    pub fn prune(&self, max_retain: usize) {
        let dropped = {
            let mut state = self.state.lock();
            let mut dropped = Vec::new();
            while state.items.len() > max_retain {
                match state.items.pop_last() {
                    Some((_, b)) => dropped.push(b),
                    None => break,
                }
            }
            dropped
        };
        for b in dropped {
            b.finished();
        }
    }

    /// Drop every queued broadcast.
    pub fn reset(&self) {
        let drained = std::mem::take(&mut self.state.lock().items);
        for (_, b) in drained {
            b.finished();
        }
    }
}

/// A membership update (alive / suspect / dead) about one node.
#[derive(Debug)]
pub struct MemberBroadcast {
    node: String,
    msg: Bytes,
    notify: Option<async_channel::Sender<()>>,
}

impl MemberBroadcast {
    /// Create a broadcast about `node` carrying an encoded message.
    pub fn new(node: impl Into<String>, msg: Bytes) -> Self {
        Self {
            node: node.into(),
            msg,
            notify: None,
        }
    }

    /// Attach a completion signal that is closed when the broadcast retires.
    pub fn with_notify(mut self, notify: async_channel::Sender<()>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Name of the node this update is about.
    pub fn node(&self) -> &str {
        &self.node
    }
}

impl Broadcast for MemberBroadcast {
    fn invalidates(&self, other: &Self) -> bool {
        self.node == other.node
    }

    fn message(&self) -> &Bytes {
        &self.msg
    }

    fn finished(&self) {
        if let Some(notify) = &self.notify {
            notify.close();
        }
    }
}
