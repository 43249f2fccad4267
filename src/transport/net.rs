//! UDP + TCP transport.
//!
//! Datagrams go over a `UdpSocket`; reliable exchanges open a short-lived
//! TCP connection to the same port and carry one length-prefixed request
//! frame and one response frame:
//!
//! ```text
//! ┌──────────────┬─────────────────┐
//! │ len (u32 BE) │ payload         │
//! └──────────────┴─────────────────┘
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use super::{Packet, StreamRequest, Transport};

/// Largest frame accepted on a stream.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest datagram read from the UDP socket.
const MAX_PACKET_SIZE: usize = 65_536;

/// Inbound channel capacity.
const CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on a single inbound stream exchange.
const STREAM_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for [`NetTransport`].
#[derive(Debug, Error)]
pub enum NetTransportError {
    /// Failed to bind the UDP socket or TCP listener.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we attempted to bind.
        addr: SocketAddr,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Socket IO failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A frame exceeded [`MAX_FRAME_SIZE`].
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// The transport has been shut down.
    #[error("transport shut down")]
    Closed,
}

/// Transport over real sockets.
#[derive(Debug, Clone)]
pub struct NetTransport {
    inner: Arc<NetInner>,
}

#[derive(Debug)]
struct NetInner {
    local_addr: SocketAddr,
    udp: Arc<UdpSocket>,
    packets: async_channel::Receiver<Packet>,
    streams: async_channel::Receiver<StreamRequest>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetTransport {
    /// Bind UDP and TCP on `addr`.
    ///
    /// With port 0 the TCP listener picks the port and UDP binds to the same one.
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetTransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetTransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| NetTransportError::Bind { addr, source })?;
        let udp = UdpSocket::bind(local_addr)
            .await
            .map_err(|source| NetTransportError::Bind {
                addr: local_addr,
                source,
            })?;
        let udp = Arc::new(udp);

        let (packet_tx, packets) = async_channel::bounded(CHANNEL_CAPACITY);
        let (stream_tx, streams) = async_channel::bounded(CHANNEL_CAPACITY);

        let udp_task = tokio::spawn(Self::packet_listener(udp.clone(), packet_tx));
        let tcp_task = tokio::spawn(Self::stream_listener(listener, stream_tx));

        tracing::debug!(%local_addr, "net transport bound");

        Ok(Self {
            inner: Arc::new(NetInner {
                local_addr,
                udp,
                packets,
                streams,
                tasks: Mutex::new(vec![udp_task, tcp_task]),
            }),
        })
    }

    async fn packet_listener(udp: Arc<UdpSocket>, tx: async_channel::Sender<Packet>) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            match udp.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    let packet = Packet {
                        from,
                        payload: Bytes::copy_from_slice(&buf[..len]),
                    };
                    if tx.send(packet).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // ICMP errors surface here on some platforms; keep reading.
                    tracing::trace!("udp receive error: {}", e);
                }
            }
        }
        tracing::debug!("udp listener stopped");
    }

    async fn stream_listener(listener: TcpListener, tx: async_channel::Sender<StreamRequest>) {
        loop {
            let (stream, from) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::debug!("tcp accept error: {}", e);
                    continue;
                }
            };
            if tx.is_closed() {
                break;
            }
            let tx = tx.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(STREAM_IO_TIMEOUT, Self::serve_stream(stream, from, tx))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!(%from, "stream exchange failed: {}", e),
                    Err(_) => tracing::debug!(%from, "stream exchange timed out"),
                }
            });
        }
        tracing::debug!("tcp listener stopped");
    }

    async fn serve_stream(
        mut stream: TcpStream,
        from: SocketAddr,
        tx: async_channel::Sender<StreamRequest>,
    ) -> Result<(), NetTransportError> {
        let payload = read_frame(&mut stream).await?;
        let (request, reply) = StreamRequest::new(from, payload);
        tx.send(request)
            .await
            .map_err(|_| NetTransportError::Closed)?;
        let response = reply.await.map_err(|_| NetTransportError::Closed)?;
        write_frame(&mut stream, &response).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Bytes, NetTransportError> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetTransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), NetTransportError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(NetTransportError::FrameTooLarge(payload.len()));
    }
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

impl Transport for NetTransport {
    type Error = NetTransportError;

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    async fn send_packet(&self, target: SocketAddr, payload: Bytes) -> Result<(), Self::Error> {
        self.inner.udp.send_to(&payload, target).await?;
        Ok(())
    }

    async fn exchange(&self, target: SocketAddr, payload: Bytes) -> Result<Bytes, Self::Error> {
        let mut stream = TcpStream::connect(target).await?;
        write_frame(&mut stream, &payload).await?;
        read_frame(&mut stream).await
    }

    fn packets(&self) -> async_channel::Receiver<Packet> {
        self.inner.packets.clone()
    }

    fn streams(&self) -> async_channel::Receiver<StreamRequest> {
        self.inner.streams.clone()
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        self.inner.packets.close();
        self.inner.streams.close();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bind_local() -> NetTransport {
        NetTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_udp_and_tcp_share_port() {
        let t = bind_local().await;
        assert_ne!(t.local_addr().port(), 0);
        assert_eq!(t.inner.udp.local_addr().unwrap(), t.local_addr());
        t.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_packet_delivery() {
        let a = bind_local().await;
        let b = bind_local().await;

        a.send_packet(b.local_addr(), Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let packet = b.packets().recv().await.unwrap();
        assert_eq!(packet.from, a.local_addr());
        assert_eq!(packet.payload, Bytes::from_static(b"hello"));

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_exchange() {
        let a = bind_local().await;
        let b = bind_local().await;

        let streams = b.streams();
        let server = tokio::spawn(async move {
            let req = streams.recv().await.unwrap();
            let mut reply = req.payload.to_vec();
            reply.reverse();
            req.respond(Bytes::from(reply));
        });

        let response = a
            .exchange(b.local_addr(), Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(response, Bytes::from_static(b"cba"));
        server.await.unwrap();

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let a = bind_local().await;
        let err = NetTransport::bind(a.local_addr()).await.unwrap_err();
        assert!(matches!(err, NetTransportError::Bind { .. }));
        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels() {
        let t = bind_local().await;
        let packets = t.packets();
        t.shutdown().await.unwrap();
        assert!(packets.recv().await.is_err());
    }
}
