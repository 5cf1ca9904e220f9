use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, trace, warn};
use crate::config::TransportArgs;
use crate::xport::{FrameAllocator, FrameSink, ManagedRecvBuffer, ManagedSendBuffer, ZeroCopyTransport};

/// A zero-copy transport over a connected UDP socket. Each frame is one datagram.
pub struct UdpZeroCopy {
    socket: Arc<UdpSocket>,
    sink: Arc<UdpSink>,
    recv_frames: FrameAllocator,
    send_frames: FrameAllocator,
    actual_recv_buff_size: usize,
    actual_send_buff_size: usize,
}

struct UdpSink {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl FrameSink for UdpSink {
    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        let num_sent = self.socket.send(frame).await?;
        if num_sent != frame.len() {
            warn!("sent only {} of {} bytes in a UDP datagram", num_sent, frame.len());
        }
        Ok(())
    }
}

impl UdpZeroCopy {
    /// Bind `local` (port 0 for an ephemeral port) and connect to the device at `remote`.
    ///  Socket buffer sizes from `args` are requested from the OS; the OS may grant less, which
    ///  is logged.
    pub async fn connect(local: SocketAddr, remote: SocketAddr, args: &TransportArgs) -> anyhow::Result<UdpZeroCopy> {
        args.validate()?;

        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
        Self::request_buffer_sizes(&socket, args);
        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;

        let actual_recv_buff_size = socket.recv_buffer_size()?;
        let actual_send_buff_size = socket.send_buffer_size()?;

        let socket = UdpSocket::from_std(socket.into())?;
        socket.connect(remote).await?;
        debug!("UDP transport {:?} -> {:?} with socket buffers {}/{}", socket.local_addr(), remote, actual_recv_buff_size, actual_send_buff_size);

        let socket = Arc::new(socket);
        Ok(UdpZeroCopy {
            sink: Arc::new(UdpSink { socket: socket.clone() }),
            socket,
            recv_frames: FrameAllocator::new(args.recv_frame_size, args.num_recv_frames),
            send_frames: FrameAllocator::new(args.send_frame_size, args.num_send_frames),
            actual_recv_buff_size,
            actual_send_buff_size,
        })
    }

    fn request_buffer_sizes(socket: &Socket, args: &TransportArgs) {
        if let Err(e) = socket.set_recv_buffer_size(args.recv_buff_size) {
            warn!("could not set the socket receive buffer to {} bytes: {}", args.recv_buff_size, e);
        }
        if let Err(e) = socket.set_send_buffer_size(args.send_buff_size) {
            warn!("could not set the socket send buffer to {} bytes: {}", args.send_buff_size, e);
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn recv_buff_size(&self) -> usize {
        self.actual_recv_buff_size
    }

    pub fn send_buff_size(&self) -> usize {
        self.actual_send_buff_size
    }
}

#[async_trait]
impl ZeroCopyTransport for UdpZeroCopy {
    async fn get_recv_buff(&self, timeout: Duration) -> Option<ManagedRecvBuffer> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut lease = self.recv_frames.acquire(timeout).await?;

        let buf = lease.buf_mut();
        match tokio::time::timeout_at(deadline, self.socket.recv(buf.raw_mut())).await {
            Ok(Ok(len)) => {
                trace!("received UDP datagram of {} bytes", len);
                buf.set_len(len);
                Some(ManagedRecvBuffer::new(lease))
            }
            Ok(Err(e)) => {
                error!("error receiving from UDP socket: {}", e);
                None
            }
            Err(_) => None,
        }
    }

    async fn get_send_buff(&self, timeout: Duration) -> Option<ManagedSendBuffer> {
        let lease = self.send_frames.acquire(timeout).await?;
        Some(ManagedSendBuffer::new(lease, self.sink.clone()))
    }

    fn num_recv_frames(&self) -> usize {
        self.recv_frames.num_frames()
    }

    fn recv_frame_size(&self) -> usize {
        self.recv_frames.frame_size()
    }

    fn num_send_frames(&self) -> usize {
        self.send_frames.num_frames()
    }

    fn send_frame_size(&self) -> usize {
        self.send_frames.frame_size()
    }
}
