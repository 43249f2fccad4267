//! Membership protocol message types.
//!
//! Every packet starts with a one-byte [`MessageTag`]. Fixed-width integers
//! are big-endian, strings are `u16` length-prefixed UTF-8 and addresses are
//! a family byte followed by the IP octets and a `u16` port.
//!
//! Compound packets bundle several encoded messages so that pending
//! broadcasts ride along with probes, acks and gossip:
//!
//! ```text
//! ┌─────┬───────┬──────────────────────┬──────────────────────┐
//! │ tag │ count │ len[0] .. len[n-1]   │ body[0] .. body[n-1] │
//! │ u8  │ u8    │ u16 each             │                      │
//! └─────┴───────┴──────────────────────┴──────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;

use super::codec::{addr_len, get_addr, get_str, put_addr, put_str, str_len};
use crate::membership::NodeState;

/// Maximum number of parts in a compound packet.
pub const MAX_COMPOUND_PARTS: usize = u8::MAX as usize;

/// Per-part overhead of a compound packet (the length prefix).
pub const COMPOUND_PART_OVERHEAD: usize = 2;

/// Fixed header of a compound packet (tag + count).
pub const COMPOUND_HEADER_OVERHEAD: usize = 2;

/// Overhead of wrapping an application payload in a user message.
pub const USER_MSG_OVERHEAD: usize = 1;

/// Upper bound on node states accepted in a single push/pull message.
pub const MAX_PUSH_NODES: usize = 1 << 16;

/// Message type tags for encoding.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    /// Direct probe.
    Ping = 1,
    /// Probe relayed through another node.
    IndirectPing = 2,
    /// Probe acknowledgement.
    Ack = 3,
    /// Suspicion about a node.
    Suspect = 4,
    /// Alive announcement / refutation.
    Alive = 5,
    /// Death announcement.
    Dead = 6,
    /// Full state exchange.
    PushPull = 7,
    /// Application payload.
    User = 8,
    /// Several messages in one packet.
    Compound = 9,
}

impl TryFrom<u8> for MessageTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageTag::Ping),
            2 => Ok(MessageTag::IndirectPing),
            3 => Ok(MessageTag::Ack),
            4 => Ok(MessageTag::Suspect),
            5 => Ok(MessageTag::Alive),
            6 => Ok(MessageTag::Dead),
            7 => Ok(MessageTag::PushPull),
            8 => Ok(MessageTag::User),
            9 => Ok(MessageTag::Compound),
            _ => Err(value),
        }
    }
}

/// Direct liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    /// Sequence number echoed in the ack.
    pub seq: u32,
    /// Name of the node being probed.
    pub target: String,
    /// Name of the probing node.
    pub source: String,
}

/// Request to probe `target` on behalf of `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectPing {
    /// Sequence number of the original probe.
    pub seq: u32,
    /// Name of the node being probed.
    pub target: String,
    /// Address of the node being probed.
    pub target_addr: SocketAddr,
    /// Name of the node that asked for the probe.
    pub source: String,
}

/// Probe acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Sequence number of the probe being answered.
    pub seq: u32,
}

/// A node is alive at the given incarnation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alive {
    /// Incarnation of the announcement.
    pub incarnation: u32,
    /// Node name.
    pub node: String,
    /// Node gossip address.
    pub addr: SocketAddr,
}

/// `from` suspects `node` at the given incarnation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suspect {
    /// Incarnation the accusation applies to.
    pub incarnation: u32,
    /// Suspected node.
    pub node: String,
    /// Accusing node.
    pub from: String,
}

/// `from` declares `node` dead at the given incarnation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dead {
    /// Incarnation the declaration applies to.
    pub incarnation: u32,
    /// Dead node.
    pub node: String,
    /// Declaring node. Equal to `node` for a voluntary leave.
    pub from: String,
}

/// One row of the membership table, as carried in a push/pull exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNodeState {
    /// Node name.
    pub name: String,
    /// Node gossip address.
    pub addr: SocketAddr,
    /// Incarnation number.
    pub incarnation: u32,
    /// Liveness state.
    pub state: NodeState,
}

/// Full state snapshot exchanged during anti-entropy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPull {
    /// Whether this exchange is part of a join.
    pub join: bool,
    /// Membership table of the sender.
    pub nodes: Vec<PushNodeState>,
    /// Opaque application state (the delegate's `local_state`).
    pub user_state: Bytes,
}

/// Protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Direct probe.
    Ping(Ping),
    /// Relayed probe request.
    IndirectPing(IndirectPing),
    /// Probe acknowledgement.
    Ack(Ack),
    /// Suspicion.
    Suspect(Suspect),
    /// Alive announcement.
    Alive(Alive),
    /// Death announcement.
    Dead(Dead),
    /// Full state exchange.
    PushPull(PushPull),
    /// Application payload handed to the delegate.
    User(Bytes),
    /// Raw encoded messages bundled into one packet.
    Compound(Vec<Bytes>),
}

impl Message {
    /// Get the tag of this message.
    pub const fn tag(&self) -> MessageTag {
        match self {
            Message::Ping(_) => MessageTag::Ping,
            Message::IndirectPing(_) => MessageTag::IndirectPing,
            Message::Ack(_) => MessageTag::Ack,
            Message::Suspect(_) => MessageTag::Suspect,
            Message::Alive(_) => MessageTag::Alive,
            Message::Dead(_) => MessageTag::Dead,
            Message::PushPull(_) => MessageTag::PushPull,
            Message::User(_) => MessageTag::User,
            Message::Compound(_) => MessageTag::Compound,
        }
    }

    /// Encode the message into bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag() as u8);
        match self {
            Message::Ping(ping) => {
                buf.put_u32(ping.seq);
                put_str(buf, &ping.target);
                put_str(buf, &ping.source);
            }
            Message::IndirectPing(req) => {
                buf.put_u32(req.seq);
                put_str(buf, &req.target);
                put_addr(buf, &req.target_addr);
                put_str(buf, &req.source);
            }
            Message::Ack(ack) => {
                buf.put_u32(ack.seq);
            }
            Message::Suspect(s) => {
                buf.put_u32(s.incarnation);
                put_str(buf, &s.node);
                put_str(buf, &s.from);
            }
            Message::Alive(a) => {
                buf.put_u32(a.incarnation);
                put_str(buf, &a.node);
                put_addr(buf, &a.addr);
            }
            Message::Dead(d) => {
                buf.put_u32(d.incarnation);
                put_str(buf, &d.node);
                put_str(buf, &d.from);
            }
            Message::PushPull(pp) => {
                buf.put_u8(pp.join as u8);
                buf.put_u32(pp.nodes.len() as u32);
                for node in &pp.nodes {
                    put_str(buf, &node.name);
                    put_addr(buf, &node.addr);
                    buf.put_u32(node.incarnation);
                    buf.put_u8(node.state as u8);
                }
                buf.put_u32(pp.user_state.len() as u32);
                buf.put_slice(&pp.user_state);
            }
            Message::User(payload) => {
                buf.put_slice(payload);
            }
            Message::Compound(parts) => {
                let parts = &parts[..parts.len().min(MAX_COMPOUND_PARTS)];
                buf.put_u8(parts.len() as u8);
                for part in parts {
                    buf.put_u16(part.len() as u16);
                }
                for part in parts {
                    buf.put_slice(part);
                }
            }
        }
    }

    /// Encode the message into a new Bytes buffer.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Calculate the encoded length of the message.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Message::Ping(ping) => 4 + str_len(&ping.target) + str_len(&ping.source),
            Message::IndirectPing(req) => {
                4 + str_len(&req.target) + addr_len(&req.target_addr) + str_len(&req.source)
            }
            Message::Ack(_) => 4,
            Message::Suspect(s) => 4 + str_len(&s.node) + str_len(&s.from),
            Message::Alive(a) => 4 + str_len(&a.node) + addr_len(&a.addr),
            Message::Dead(d) => 4 + str_len(&d.node) + str_len(&d.from),
            Message::PushPull(pp) => {
                1 + 4
                    + pp
                        .nodes
                        .iter()
                        .map(|n| str_len(&n.name) + addr_len(&n.addr) + 4 + 1)
                        .sum::<usize>()
                    + 4
                    + pp.user_state.len()
            }
            Message::User(payload) => payload.len(),
            Message::Compound(parts) => {
                let parts = &parts[..parts.len().min(MAX_COMPOUND_PARTS)];
                1 + parts
                    .iter()
                    .map(|p| COMPOUND_PART_OVERHEAD + p.len())
                    .sum::<usize>()
            }
        }
    }

    /// Decode a message from bytes.
    ///
    /// Returns `None` for unknown tags and truncated or malformed input.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 1 {
            return None;
        }

        let tag = MessageTag::try_from(buf.get_u8()).ok()?;

        match tag {
            MessageTag::Ping => {
                let seq = get_u32(buf)?;
                let target = get_str(buf)?;
                let source = get_str(buf)?;
                Some(Message::Ping(Ping {
                    seq,
                    target,
                    source,
                }))
            }
            MessageTag::IndirectPing => {
                let seq = get_u32(buf)?;
                let target = get_str(buf)?;
                let target_addr = get_addr(buf)?;
                let source = get_str(buf)?;
                Some(Message::IndirectPing(IndirectPing {
                    seq,
                    target,
                    target_addr,
                    source,
                }))
            }
            MessageTag::Ack => Some(Message::Ack(Ack { seq: get_u32(buf)? })),
            MessageTag::Suspect => {
                let incarnation = get_u32(buf)?;
                let node = get_str(buf)?;
                let from = get_str(buf)?;
                Some(Message::Suspect(Suspect {
                    incarnation,
                    node,
                    from,
                }))
            }
            MessageTag::Alive => {
                let incarnation = get_u32(buf)?;
                let node = get_str(buf)?;
                let addr = get_addr(buf)?;
                Some(Message::Alive(Alive {
                    incarnation,
                    node,
                    addr,
                }))
            }
            MessageTag::Dead => {
                let incarnation = get_u32(buf)?;
                let node = get_str(buf)?;
                let from = get_str(buf)?;
                Some(Message::Dead(Dead {
                    incarnation,
                    node,
                    from,
                }))
            }
            MessageTag::PushPull => {
                if buf.remaining() < 5 {
                    return None;
                }
                let join = buf.get_u8() != 0;
                let count = buf.get_u32() as usize;
                if count > MAX_PUSH_NODES {
                    return None;
                }
                let mut nodes = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let name = get_str(buf)?;
                    let addr = get_addr(buf)?;
                    if buf.remaining() < 5 {
                        return None;
                    }
                    let incarnation = buf.get_u32();
                    let state = NodeState::try_from(buf.get_u8()).ok()?;
                    nodes.push(PushNodeState {
                        name,
                        addr,
                        incarnation,
                        state,
                    });
                }
                let user_len = get_u32(buf)? as usize;
                if buf.remaining() < user_len {
                    return None;
                }
                let user_state = buf.copy_to_bytes(user_len);
                Some(Message::PushPull(PushPull {
                    join,
                    nodes,
                    user_state,
                }))
            }
            MessageTag::User => Some(Message::User(buf.copy_to_bytes(buf.remaining()))),
            MessageTag::Compound => {
                if buf.remaining() < 1 {
                    return None;
                }
                let count = buf.get_u8() as usize;
                if buf.remaining() < count * 2 {
                    return None;
                }
                let lens: Vec<usize> = (0..count).map(|_| buf.get_u16() as usize).collect();
                let mut parts = Vec::with_capacity(count);
                for len in lens {
                    if buf.remaining() < len {
                        return None;
                    }
                    parts.push(buf.copy_to_bytes(len));
                }
                Some(Message::Compound(parts))
            }
        }
    }

    /// Decode a message from a byte slice.
    pub fn decode_from_slice(data: &[u8]) -> Option<Self> {
        let mut buf = data;
        Self::decode(&mut buf)
    }

    /// Build a compound message from already-encoded messages.
    ///
    /// A single part is returned as-is instead of being wrapped.
    pub fn compound(mut parts: Vec<Bytes>) -> Bytes {
        if parts.len() == 1 {
            return parts.pop().unwrap_or_default();
        }
        Message::Compound(parts).encode_to_bytes()
    }

    /// Check if this is a probe-related message.
    pub const fn is_probe(&self) -> bool {
        matches!(
            self,
            Message::Ping(_) | Message::IndirectPing(_) | Message::Ack(_)
        )
    }
}

fn get_u32(buf: &mut impl Buf) -> Option<u32> {
    if buf.remaining() < 4 {
        return None;
    }
    Some(buf.get_u32())
}
