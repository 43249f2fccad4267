//! In-process transport for tests and simulations.
//!
//! A [`MemoryNetwork`] routes traffic between [`MemoryTransport`] endpoints
//! by address. Its [`ChaosController`] decides per message whether it is
//! delivered, delayed or dropped, which makes partitions and message loss
//! reproducible without touching real sockets.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::{Packet, StreamRequest, Transport};
use crate::testing::ChaosController;

const CHANNEL_CAPACITY: usize = 1024;
const FIRST_PORT: u16 = 20_000;

/// Error type for [`MemoryTransport`].
#[derive(Debug, Error)]
pub enum MemoryTransportError {
    /// Another endpoint already uses this address.
    #[error("address {0} already in use")]
    AddrInUse(SocketAddr),

    /// No endpoint at the target address, or it is partitioned from us.
    #[error("{0} is unreachable")]
    Unreachable(SocketAddr),

    /// The peer dropped the request without answering.
    #[error("exchange with {0} was abandoned")]
    Abandoned(SocketAddr),
}

#[derive(Debug, Clone)]
struct Endpoint {
    packets: async_channel::Sender<Packet>,
    streams: async_channel::Sender<StreamRequest>,
}

#[derive(Debug)]
struct NetworkInner {
    endpoints: RwLock<HashMap<SocketAddr, Endpoint>>,
    chaos: ChaosController<SocketAddr>,
    next_port: AtomicU16,
}

/// A simulated network connecting memory transports.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create an empty network with chaos disabled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: RwLock::new(HashMap::new()),
                chaos: ChaosController::new(),
                next_port: AtomicU16::new(FIRST_PORT),
            }),
        }
    }

    /// Chaos controller for loss, latency and partitions.
    pub fn chaos(&self) -> &ChaosController<SocketAddr> {
        &self.inner.chaos
    }

    /// Attach a transport at the next free loopback address.
    pub fn bind(&self) -> MemoryTransport {
        loop {
            let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            if let Ok(transport) = self.bind_addr(addr) {
                return transport;
            }
        }
    }

    /// Attach a transport at a specific address.
    pub fn bind_addr(&self, addr: SocketAddr) -> Result<MemoryTransport, MemoryTransportError> {
        let mut endpoints = self.inner.endpoints.write();
        if endpoints.contains_key(&addr) {
            return Err(MemoryTransportError::AddrInUse(addr));
        }
        let (packet_tx, packets) = async_channel::bounded(CHANNEL_CAPACITY);
        let (stream_tx, streams) = async_channel::bounded(CHANNEL_CAPACITY);
        endpoints.insert(
            addr,
            Endpoint {
                packets: packet_tx,
                streams: stream_tx,
            },
        );
        Ok(MemoryTransport {
            addr,
            network: self.clone(),
            packets,
            streams,
        })
    }

    /// Number of attached endpoints.
    pub fn num_endpoints(&self) -> usize {
        self.inner.endpoints.read().len()
    }

    fn endpoint(&self, addr: &SocketAddr) -> Option<Endpoint> {
        self.inner.endpoints.read().get(addr).cloned()
    }

    fn detach(&self, addr: &SocketAddr) {
        if let Some(endpoint) = self.inner.endpoints.write().remove(addr) {
            endpoint.packets.close();
            endpoint.streams.close();
        }
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
    packets: async_channel::Receiver<Packet>,
    streams: async_channel::Receiver<StreamRequest>,
}

impl MemoryTransport {
    /// The network this endpoint is attached to.
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Transport for MemoryTransport {
    type Error = MemoryTransportError;

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send_packet(&self, target: SocketAddr, payload: Bytes) -> Result<(), Self::Error> {
        // Datagram semantics: loss and missing peers are silent.
        let Some(latency) = self.network.inner.chaos.packet_delay(&self.addr, &target) else {
            tracing::trace!(from = %self.addr, to = %target, "packet dropped");
            return Ok(());
        };
        let Some(endpoint) = self.network.endpoint(&target) else {
            tracing::trace!(to = %target, "packet to unknown endpoint");
            return Ok(());
        };

        let packet = Packet {
            from: self.addr,
            payload,
        };
        if latency.is_zero() {
            let _ = endpoint.packets.try_send(packet);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let _ = endpoint.packets.try_send(packet);
            });
        }
        Ok(())
    }

    async fn exchange(&self, target: SocketAddr, payload: Bytes) -> Result<Bytes, Self::Error> {
        let latency = self
            .network
            .inner
            .chaos
            .stream_delay(&self.addr, &target)
            .ok_or(MemoryTransportError::Unreachable(target))?;
        let endpoint = self
            .network
            .endpoint(&target)
            .ok_or(MemoryTransportError::Unreachable(target))?;

        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }

        let (request, reply) = StreamRequest::new(self.addr, payload);
        endpoint
            .streams
            .send(request)
            .await
            .map_err(|_| MemoryTransportError::Unreachable(target))?;
        reply
            .await
            .map_err(|_| MemoryTransportError::Abandoned(target))
    }

    fn packets(&self) -> async_channel::Receiver<Packet> {
        self.packets.clone()
    }

    fn streams(&self) -> async_channel::Receiver<StreamRequest> {
        self.streams.clone()
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        self.network.detach(&self.addr);
        Ok(())
    }
}
