//! Cluster node identity and liveness state.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Liveness state of a node, as seen by the local failure detector.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Node answers probes (or has refuted every accusation).
    Alive = 0,
    /// Node missed a probe and has not refuted yet.
    Suspect = 1,
    /// Node was not refuted within the suspicion timeout, or left.
    Dead = 2,
}

impl TryFrom<u8> for NodeState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NodeState::Alive),
            1 => Ok(NodeState::Suspect),
            2 => Ok(NodeState::Dead),
            _ => Err(value),
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Alive => f.write_str("alive"),
            NodeState::Suspect => f.write_str("suspect"),
            NodeState::Dead => f.write_str("dead"),
        }
    }
}

/// A member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Unique logical name.
    pub name: String,
    /// Gossip address.
    pub addr: SocketAddr,
    /// Incarnation number, bumped by the node itself to refute suspicion.
    pub incarnation: u32,
    /// Current liveness state.
    pub state: NodeState,
}

impl Node {
    /// Create a new alive node at incarnation 0.
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            incarnation: 0,
            state: NodeState::Alive,
        }
    }

    /// Whether the node is not dead.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.state != NodeState::Dead
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.addr)
    }
}

/// Lock-free view of the number of non-dead members.
///
/// Written by the membership layer after every table change, read by the
/// broadcast queues to size their retransmit limit.
#[derive(Debug, Clone)]
pub struct ClusterSize(Arc<AtomicUsize>);

impl ClusterSize {
    /// Create a size handle for a singleton cluster.
    pub fn new() -> Self {
        Self(Arc::new(AtomicUsize::new(1)))
    }

    /// Current number of non-dead members (including the local node).
    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn set(&self, n: usize) {
        self.0.store(n, Ordering::Relaxed);
    }
}

impl Default for ClusterSize {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_roundtrip_tag() {
        for state in [NodeState::Alive, NodeState::Suspect, NodeState::Dead] {
            assert_eq!(NodeState::try_from(state as u8), Ok(state));
        }
        assert_eq!(NodeState::try_from(9), Err(9));
    }

    #[test]
    fn test_cluster_size_shared() {
        let size = ClusterSize::new();
        let other = size.clone();
        assert_eq!(other.get(), 1);
        size.set(5);
        assert_eq!(other.get(), 5);
    }
}
