//! Membership table and its state transitions.
//!
//! The [`Directory`] is a pure state machine: it applies alive, suspect and
//! dead announcements according to incarnation ordering and reports what
//! changed. Sending messages, timers and callbacks live in the
//! [`Memberlist`](crate::Memberlist) that owns it.
//!
//! ## Incarnation ordering
//!
//! - `Alive(i)` replaces the entry when `i` is strictly greater than the
//!   known incarnation.
//! - `Suspect(i)` and `Dead(i)` apply when `i` is at least the known
//!   incarnation and the node is not already in that (or a worse) state.
//! - An accusation about the local node is never applied; the caller is told
//!   to refute it with a higher incarnation instead.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::node::{ClusterSize, Node, NodeState};
use crate::message::{Alive, Dead, PushNodeState, Suspect};

/// Result of applying an alive announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliveOutcome {
    /// Stale or redundant announcement.
    Ignored,
    /// A node we did not know (or considered dead) joined.
    Joined(Node),
    /// A known node changed incarnation or address.
    Updated(Node),
}

/// Result of applying a suspicion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspectOutcome {
    /// Stale suspicion, unknown node, or the node is already suspect or dead.
    Ignored,
    /// The suspicion was about us; gossip `Alive` at this incarnation.
    Refute(u32),
    /// The node is now suspect.
    Suspected(Node),
}

/// Result of applying a death announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadOutcome {
    /// Stale announcement, unknown node, or the node is already dead.
    Ignored,
    /// The announcement was about us; gossip `Alive` at this incarnation.
    Refute(u32),
    /// The node is now dead. `left` is true when it announced its own death.
    Died {
        /// The node after the transition.
        node: Node,
        /// Whether the node left voluntarily.
        left: bool,
    },
}

#[derive(Debug, Clone)]
struct NodeEntry {
    node: Node,
    state_changed: Instant,
}

/// The local view of cluster membership.
#[derive(Debug)]
pub struct Directory {
    local: String,
    nodes: HashMap<String, NodeEntry>,
    probe_order: Vec<String>,
    probe_index: usize,
    size: ClusterSize,
}

impl Directory {
    /// Create a directory containing only the local node.
    pub fn new(local: Node, size: ClusterSize) -> Self {
        let name = local.name.clone();
        let mut nodes = HashMap::new();
        nodes.insert(
            name.clone(),
            NodeEntry {
                node: local,
                state_changed: Instant::now(),
            },
        );
        let directory = Self {
            local: name,
            nodes,
            probe_order: Vec::new(),
            probe_index: 0,
            size,
        };
        directory.refresh_size();
        directory
    }

    /// Name of the local node.
    pub fn local_name(&self) -> &str {
        &self.local
    }

    /// Snapshot of the local node.
    pub fn local_node(&self) -> Option<Node> {
        self.nodes.get(&self.local).map(|e| e.node.clone())
    }

    /// Current incarnation of the local node.
    pub fn local_incarnation(&self) -> u32 {
        self.nodes
            .get(&self.local)
            .map(|e| e.node.incarnation)
            .unwrap_or(0)
    }

    /// Look up a node by name.
    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name).map(|e| &e.node)
    }

    /// Number of non-dead nodes, including the local node.
    pub fn num_members(&self) -> usize {
        self.nodes.values().filter(|e| e.node.is_live()).count()
    }

    /// All non-dead nodes, including the local node.
    pub fn members(&self) -> Vec<Node> {
        self.nodes
            .values()
            .filter(|e| e.node.is_live())
            .map(|e| e.node.clone())
            .collect()
    }

    /// Membership table as carried in a push/pull exchange.
    pub fn push_states(&self) -> Vec<PushNodeState> {
        self.nodes
            .values()
            .map(|e| PushNodeState {
                name: e.node.name.clone(),
                addr: e.node.addr,
                incarnation: e.node.incarnation,
                state: e.node.state,
            })
            .collect()
    }

    /// Up to `k` random remote nodes accepted by `filter`.
    pub fn random_nodes(&self, k: usize, filter: impl Fn(&Node) -> bool) -> Vec<Node> {
        let mut candidates: Vec<Node> = self
            .nodes
            .values()
            .filter(|e| e.node.name != self.local && filter(&e.node))
            .map(|e| e.node.clone())
            .collect();
        candidates.shuffle(&mut rand::rng());
        candidates.truncate(k);
        candidates
    }

    /// Next node to probe.
    ///
    /// Walks a shuffled list of the remote non-dead nodes, so every node is
    /// probed once before any is probed twice. The list is reshuffled after
    /// each full pass.
    pub fn next_probe_target(&mut self) -> Option<Node> {
        let mut reshuffled = false;
        loop {
            if self.probe_index >= self.probe_order.len() {
                if reshuffled {
                    return None;
                }
                self.reshuffle();
                reshuffled = true;
                if self.probe_order.is_empty() {
                    return None;
                }
            }

            let name = &self.probe_order[self.probe_index];
            self.probe_index += 1;
            if let Some(entry) = self.nodes.get(name) {
                if entry.node.is_live() && entry.node.name != self.local {
                    return Some(entry.node.clone());
                }
            }
        }
    }

    fn reshuffle(&mut self) {
        let mut order: Vec<String> = self
            .nodes
            .values()
            .filter(|e| e.node.is_live() && e.node.name != self.local)
            .map(|e| e.node.name.clone())
            .collect();
        order.shuffle(&mut rand::rng());
        self.probe_order = order;
        self.probe_index = 0;
    }

    /// Apply an alive announcement.
    pub fn apply_alive(&mut self, alive: &Alive, now: Instant) -> AliveOutcome {
        if alive.node == self.local {
            return AliveOutcome::Ignored;
        }

        let outcome = match self.nodes.get_mut(&alive.node) {
            None => {
                let node = Node {
                    name: alive.node.clone(),
                    addr: alive.addr,
                    incarnation: alive.incarnation,
                    state: NodeState::Alive,
                };
                self.nodes.insert(
                    alive.node.clone(),
                    NodeEntry {
                        node: node.clone(),
                        state_changed: now,
                    },
                );
                // Slot the newcomer into the current pass at a random position.
                let pos = rand::rng().random_range(self.probe_index..=self.probe_order.len());
                self.probe_order.insert(pos, alive.node.clone());
                AliveOutcome::Joined(node)
            }
            Some(entry) => {
                if alive.incarnation <= entry.node.incarnation {
                    return AliveOutcome::Ignored;
                }
                let was_dead = entry.node.state == NodeState::Dead;
                entry.node.incarnation = alive.incarnation;
                entry.node.addr = alive.addr;
                if entry.node.state != NodeState::Alive {
                    entry.node.state = NodeState::Alive;
                    entry.state_changed = now;
                }
                if was_dead {
                    AliveOutcome::Joined(entry.node.clone())
                } else {
                    AliveOutcome::Updated(entry.node.clone())
                }
            }
        };

        self.refresh_size();
        outcome
    }

    /// Apply a suspicion.
    pub fn apply_suspect(&mut self, suspect: &Suspect, now: Instant) -> SuspectOutcome {
        let Some(entry) = self.nodes.get_mut(&suspect.node) else {
            return SuspectOutcome::Ignored;
        };
        if suspect.incarnation < entry.node.incarnation {
            return SuspectOutcome::Ignored;
        }

        if suspect.node == self.local {
            entry.node.incarnation = suspect.incarnation.max(entry.node.incarnation) + 1;
            return SuspectOutcome::Refute(entry.node.incarnation);
        }

        if entry.node.state != NodeState::Alive {
            return SuspectOutcome::Ignored;
        }

        entry.node.incarnation = suspect.incarnation;
        entry.node.state = NodeState::Suspect;
        entry.state_changed = now;
        SuspectOutcome::Suspected(entry.node.clone())
    }

    /// Apply a death announcement.
    pub fn apply_dead(&mut self, dead: &Dead, now: Instant) -> DeadOutcome {
        let Some(entry) = self.nodes.get_mut(&dead.node) else {
            return DeadOutcome::Ignored;
        };
        if dead.incarnation < entry.node.incarnation || entry.node.state == NodeState::Dead {
            return DeadOutcome::Ignored;
        }

        if dead.node == self.local {
            // Our own leave announcement echoed back by a peer.
            if dead.from == self.local {
                return DeadOutcome::Ignored;
            }
            entry.node.incarnation = dead.incarnation.max(entry.node.incarnation) + 1;
            return DeadOutcome::Refute(entry.node.incarnation);
        }

        entry.node.incarnation = dead.incarnation;
        entry.node.state = NodeState::Dead;
        entry.state_changed = now;
        let node = entry.node.clone();
        self.refresh_size();
        DeadOutcome::Died {
            left: dead.from == dead.node,
            node,
        }
    }

    /// Mark the local node as dead ahead of a graceful leave.
    ///
    /// Returns the announcement to gossip.
    pub fn leave_local(&mut self, now: Instant) -> Option<Dead> {
        let entry = self.nodes.get_mut(&self.local)?;
        entry.node.state = NodeState::Dead;
        entry.state_changed = now;
        let dead = Dead {
            incarnation: entry.node.incarnation,
            node: self.local.clone(),
            from: self.local.clone(),
        };
        self.refresh_size();
        Some(dead)
    }

    /// Turn suspects that have not refuted within `timeout` into dead nodes.
    pub fn expire_suspects(&mut self, now: Instant, timeout: Duration) -> Vec<Node> {
        let mut expired = Vec::new();
        for entry in self.nodes.values_mut() {
            if entry.node.state == NodeState::Suspect
                && now.saturating_duration_since(entry.state_changed) >= timeout
            {
                entry.node.state = NodeState::Dead;
                entry.state_changed = now;
                expired.push(entry.node.clone());
            }
        }
        if !expired.is_empty() {
            self.refresh_size();
        }
        expired
    }

    /// Remove remote nodes that have been dead for at least `retention`.
    pub fn reap_dead(&mut self, now: Instant, retention: Duration) -> Vec<Node> {
        let local = &self.local;
        let reaped: Vec<Node> = self
            .nodes
            .values()
            .filter(|e| {
                e.node.name != *local
                    && e.node.state == NodeState::Dead
                    && now.saturating_duration_since(e.state_changed) >= retention
            })
            .map(|e| e.node.clone())
            .collect();
        for node in &reaped {
            self.nodes.remove(&node.name);
        }
        if !reaped.is_empty() {
            self.probe_order.retain(|name| self.nodes.contains_key(name));
            self.probe_index = self.probe_index.min(self.probe_order.len());
        }
        reaped
    }

    /// Address of a node by name.
    pub fn addr_of(&self, name: &str) -> Option<SocketAddr> {
        self.nodes.get(name).map(|e| e.node.addr)
    }

    fn refresh_size(&self) {
        self.size.set(self.num_members().max(1));
    }
}
