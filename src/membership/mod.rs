//! Cluster membership: node identity, liveness states and the membership table.

mod directory;
mod node;

pub use directory::{AliveOutcome, DeadOutcome, Directory, SuspectOutcome};
pub use node::{ClusterSize, Node, NodeState};
