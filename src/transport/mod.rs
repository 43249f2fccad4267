//! Transport abstraction for the membership layer.
//!
//! The membership layer needs two kinds of delivery:
//! - **Packets**: unreliable, unordered datagrams for probes, acks and
//!   piggybacked gossip. Loss is expected and tolerated.
//! - **Streams**: a reliable request/response exchange used for push/pull
//!   anti-entropy, where the full state does not fit in a datagram.
//!
//! # Available Transports
//!
//! - [`NetTransport`]: UDP + TCP on the same port
//! - [`MemoryNetwork`] / [`MemoryTransport`]: in-process network for tests,
//!   with message loss, latency and partitions

use bytes::Bytes;
use futures::channel::oneshot;
use std::future::Future;
use std::net::SocketAddr;

mod memory;
mod net;

pub use memory::{MemoryNetwork, MemoryTransport, MemoryTransportError};
pub use net::{NetTransport, NetTransportError, MAX_FRAME_SIZE};

/// An inbound datagram.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Sender address.
    pub from: SocketAddr,
    /// Raw packet contents.
    pub payload: Bytes,
}

/// An inbound reliable request awaiting a response.
#[derive(Debug)]
pub struct StreamRequest {
    /// Peer that opened the exchange.
    pub from: SocketAddr,
    /// Request body.
    pub payload: Bytes,
    reply: oneshot::Sender<Bytes>,
}

impl StreamRequest {
    /// Create a request together with the receiver for its response.
    pub fn new(from: SocketAddr, payload: Bytes) -> (Self, oneshot::Receiver<Bytes>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                from,
                payload,
                reply,
            },
            rx,
        )
    }

    /// Send the response. Returns `false` if the requester went away.
    pub fn respond(self, payload: Bytes) -> bool {
        self.reply.send(payload).is_ok()
    }
}

/// Transport trait for cluster traffic.
///
/// Inbound traffic is delivered through the [`packets`](Transport::packets)
/// and [`streams`](Transport::streams) channels, which are closed when the
/// transport shuts down.
#[auto_impl::auto_impl(Box, Arc)]
pub trait Transport: Send + Sync + 'static {
    /// Error type for transport operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Address the transport is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Send a best-effort datagram.
    fn send_packet(
        &self,
        target: SocketAddr,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Send a request over a reliable stream and wait for the response.
    ///
    /// Callers apply their own timeout.
    fn exchange(
        &self,
        target: SocketAddr,
        payload: Bytes,
    ) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;

    /// Receiver of inbound datagrams.
    fn packets(&self) -> async_channel::Receiver<Packet>;

    /// Receiver of inbound reliable requests.
    fn streams(&self) -> async_channel::Receiver<StreamRequest>;

    /// Stop accepting traffic and release sockets.
    fn shutdown(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_request_respond() {
        let (req, rx) = StreamRequest::new(
            "127.0.0.1:1".parse().unwrap(),
            Bytes::from_static(b"ping"),
        );
        assert_eq!(req.payload, Bytes::from_static(b"ping"));
        assert!(req.respond(Bytes::from_static(b"pong")));
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_stream_request_requester_gone() {
        let (req, rx) = StreamRequest::new("127.0.0.1:1".parse().unwrap(), Bytes::new());
        drop(rx);
        assert!(!req.respond(Bytes::new()));
    }
}
