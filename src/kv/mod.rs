//! The replicated key-value layer.
//!
//! - [`Update`] / [`GossipMessage`]: incremental changes and their wire form
//! - [`Store`]: the local mapping
//! - [`KvBroadcast`]: an encoded batch waiting in the broadcast queue
//! - [`KvDelegate`]: plugs the store into the membership layer's gossip and
//!   push/pull hooks

mod broadcast;
mod delegate;
mod store;
mod update;

pub use broadcast::KvBroadcast;
pub use delegate::KvDelegate;
pub use store::Store;
pub use update::{encode_delta, Action, GossipMessage, Update, DATA_TAG, TRACKED_TAG};

pub use crate::config::MergePolicy;
