//! Store updates and their gossip encoding.
//!
//! A gossip payload is a one-byte tag followed by a tag-specific body.
//!
//! - [`DATA_TAG`]: the body is a JSON array of updates.
//! - [`TRACKED_TAG`]: the body is a 16-byte message id followed by the same
//!   JSON array. Nodes relay a tracked payload once per id.
//!
//! ```text
//! d[{"Action":"add","Data":{"x":"1"}},{"Action":"del","Data":{"y":""}}]
//! t<16 id bytes>[{"Action":"add","Data":{"x":"1"}}]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Tag of a gossip payload carrying store updates.
pub const DATA_TAG: u8 = b'd';

/// Tag of a gossip payload carrying store updates under a message id.
pub const TRACKED_TAG: u8 = b't';

const ID_LEN: usize = 16;

/// Kind of change carried by an [`Update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Set each key to its value.
    Add,
    /// Remove each key; values are ignored.
    Del,
    /// Any action this version does not understand. Applying it is a no-op.
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Add => f.write_str("add"),
            Action::Del => f.write_str("del"),
            Action::Unknown => f.write_str("unknown"),
        }
    }
}

/// A change to the replicated mapping.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Update {
    /// What to do with the keys in `data`.
    #[serde(rename = "Action", default)]
    pub action: Action,
    /// Keys (and, for `add`, values) affected.
    #[serde(rename = "Data", default)]
    pub data: BTreeMap<String, String>,
}

impl Update {
    /// Create an update.
    pub fn new(action: Action, data: BTreeMap<String, String>) -> Self {
        Self { action, data }
    }

    /// Set `key` to `value`.
    pub fn add(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert(key.into(), value.into());
        Self::new(Action::Add, data)
    }

    /// Remove `key`.
    pub fn del(key: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert(key.into(), String::new());
        Self::new(Action::Del, data)
    }

    /// Keys touched by this update.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }
}

/// A gossip payload exchanged between stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    /// A batch of updates to apply in order.
    Data(Vec<Update>),
    /// A batch of updates identified by a unique id.
    Tracked {
        /// Assigned by the node that made the change.
        id: Uuid,
        /// Updates to apply in order.
        updates: Vec<Update>,
    },
}

impl GossipMessage {
    /// Get the tag of this message.
    pub const fn tag(&self) -> u8 {
        match self {
            GossipMessage::Data(_) => DATA_TAG,
            GossipMessage::Tracked { .. } => TRACKED_TAG,
        }
    }

    /// Message id, if the payload carries one.
    pub fn id(&self) -> Option<Uuid> {
        match self {
            GossipMessage::Data(_) => None,
            GossipMessage::Tracked { id, .. } => Some(*id),
        }
    }

    /// The updates carried.
    pub fn updates(&self) -> &[Update] {
        match self {
            GossipMessage::Data(updates) | GossipMessage::Tracked { updates, .. } => updates,
        }
    }

    /// Encode into tag + body.
    pub fn encode(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(self.updates())?;
        let id = self.id();
        let id_len = if id.is_some() { ID_LEN } else { 0 };

        let mut buf = BytesMut::with_capacity(1 + id_len + body.len());
        buf.put_u8(self.tag());
        if let Some(id) = id {
            buf.put_slice(id.as_bytes());
        }
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode a gossip payload.
    ///
    /// The whole payload is validated before anything is returned, so a
    /// malformed batch is never applied partially.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (&tag, body) = buf
            .split_first()
            .ok_or_else(|| Error::Decode("empty gossip payload".into()))?;
        match tag {
            DATA_TAG => Ok(GossipMessage::Data(serde_json::from_slice(body)?)),
            TRACKED_TAG => {
                if body.len() < ID_LEN {
                    return Err(Error::Decode("truncated gossip message id".into()));
                }
                let (id, body) = body.split_at(ID_LEN);
                let id = Uuid::from_slice(id).map_err(|e| Error::Decode(e.to_string()))?;
                Ok(GossipMessage::Tracked {
                    id,
                    updates: serde_json::from_slice(body)?,
                })
            }
            other => Err(Error::Decode(format!("unknown gossip tag {:#04x}", other))),
        }
    }
}

/// Encode a single update as a data gossip payload.
pub fn encode_delta(action: Action, data: BTreeMap<String, String>) -> Result<Bytes> {
    GossipMessage::Data(vec![Update::new(action, data)]).encode()
}
