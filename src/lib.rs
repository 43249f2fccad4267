//! # memberlist-kv
//!
//! An eventually-consistent key-value store replicated by gossip.
//!
//! Every node holds a full copy of a string mapping. Local writes are applied
//! immediately and disseminated as small deltas piggybacked on the failure
//! detector's traffic; periodic (and join-time) push/pull exchanges of the
//! full state repair anything gossip missed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Application (HTTP, CLI, ...)                  │
//! └────────────────────────────┬────────────────────────────────────┘
//!                              │ submit_local_change() / read_local()
//! ┌────────────────────────────▼────────────────────────────────────┐
//! │                            KvNode                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  KvDelegate: Store + TransmitLimitedQueue<KvBroadcast>           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Memberlist: probe / gossip / push-pull loops, Directory         │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │   NetTransport (UDP + TCP)   │  MemoryTransport (tests, chaos)  │
//! └──────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! Updates carry no versions: each node applies them in arrival order, so the
//! last write a node *observes* wins. Concurrent writes to the same key on
//! different nodes may be lost. Replicas converge once writes stop and
//! gossip and anti-entropy have run.
//!
//! ## Example
//!
//! ```ignore
//! use memberlist_kv::{ClusterConfig, KvNode};
//!
//! let (node, status) = KvNode::start_node(ClusterConfig::lan(), &["10.0.0.1:7946"]).await?;
//! node.add("x", "1")?;
//! assert_eq!(node.read_local("x").as_deref(), Some("1"));
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]

mod broadcast;
mod config;
mod delegate;
mod error;
mod memberlist;
mod node;

pub mod kv;
pub mod membership;
pub mod message;
pub mod testing;
pub mod transport;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

// Re-export broadcast queue types
pub use broadcast::{retransmit_limit, Broadcast, MemberBroadcast, TransmitLimitedQueue};

// Re-export config types
pub use config::{ClusterConfig, MergePolicy};

// Re-export delegate types
pub use delegate::{Delegate, NoopDelegate};

// Re-export error types
pub use error::{Error, Result};

// Re-export key-value types
pub use kv::{Action, GossipMessage, KvBroadcast, KvDelegate, Store, Update};

// Re-export membership types
pub use membership::{ClusterSize, Node, NodeState};

// Re-export the membership layer
pub use memberlist::Memberlist;

// Re-export node types
pub use node::{JoinStatus, KvNode};

// Re-export transport types
pub use transport::{
    MemoryNetwork, MemoryTransport, NetTransport, Packet, StreamRequest, Transport,
};
