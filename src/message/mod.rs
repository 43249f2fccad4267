//! Binary wire protocol for the membership layer.
//!
//! This module contains:
//! - [`Message`] - Protocol message types
//! - [`MessageTag`] - One-byte type tags
//! - Field codecs shared by the message encoders

mod codec;
mod types;

pub use types::{
    Ack, Alive, Dead, IndirectPing, Message, MessageTag, Ping, PushNodeState, PushPull, Suspect,
    COMPOUND_HEADER_OVERHEAD, COMPOUND_PART_OVERHEAD, MAX_COMPOUND_PARTS, MAX_PUSH_NODES,
    USER_MSG_OVERHEAD,
};
