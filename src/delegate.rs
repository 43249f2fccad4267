//! Application hooks into the membership layer.

use bytes::Bytes;

use crate::membership::Node;

/// Delegate for application state carried by the membership layer.
///
/// All methods are called synchronously from the packet and stream handlers.
/// Do not block in them.
#[auto_impl::auto_impl(Box, Arc)]
pub trait Delegate: Send + Sync + 'static {
    /// Called with the payload of every user message received over gossip.
    fn notify_msg(&self, msg: Bytes);

    /// Application broadcasts to piggyback on an outgoing packet.
    ///
    /// Each returned message costs `overhead + len` bytes out of `limit`.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Bytes>;

    /// Full application state to send in a push/pull exchange.
    fn local_state(&self, join: bool) -> Bytes;

    /// Merge the application state received in a push/pull exchange.
    fn merge_remote_state(&self, buf: &[u8], join: bool);

    /// A node joined (or came back from the dead).
    fn notify_join(&self, _node: &Node) {}

    /// A node died or left.
    fn notify_leave(&self, _node: &Node) {}

    /// A node changed address or incarnation.
    fn notify_update(&self, _node: &Node) {}
}

/// Delegate that carries no application state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegate;

impl Delegate for NoopDelegate {
    fn notify_msg(&self, _msg: Bytes) {}

    fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Bytes> {
        Vec::new()
    }

    fn local_state(&self, _join: bool) -> Bytes {
        Bytes::new()
    }

    fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
}
