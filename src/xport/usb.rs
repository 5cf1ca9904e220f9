use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{error, trace};
use crate::config::TransportArgs;
use crate::xport::{FrameAllocator, FrameSink, ManagedRecvBuffer, ManagedSendBuffer, ZeroCopyTransport};

/// Bulk transfers on an opened USB device
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UsbBulkDevice: Send + Sync + 'static {
    /// `None` on timeout
    async fn bulk_read(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> anyhow::Result<Option<usize>>;
    async fn bulk_write(&self, endpoint: u8, data: &[u8]) -> anyhow::Result<usize>;
}

/// A zero-copy transport over a pair of USB bulk endpoints. Every transfer is one frame.
pub struct UsbZeroCopy {
    device: Arc<dyn UsbBulkDevice>,
    recv_endpoint: u8,
    sink: Arc<UsbSink>,
    recv_frames: FrameAllocator,
    send_frames: FrameAllocator,
}

struct UsbSink {
    device: Arc<dyn UsbBulkDevice>,
    endpoint: u8,
}

#[async_trait]
impl FrameSink for UsbSink {
    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        let written = self.device.bulk_write(self.endpoint, frame).await?;
        if written != frame.len() {
            anyhow::bail!("short USB bulk write on endpoint {:#04x}: {} of {} bytes", self.endpoint, written, frame.len());
        }
        Ok(())
    }
}

impl UsbZeroCopy {
    pub fn new(device: Arc<dyn UsbBulkDevice>, recv_endpoint: u8, send_endpoint: u8, args: &TransportArgs) -> anyhow::Result<UsbZeroCopy> {
        args.validate()?;
        Ok(UsbZeroCopy {
            sink: Arc::new(UsbSink { device: device.clone(), endpoint: send_endpoint }),
            device,
            recv_endpoint,
            recv_frames: FrameAllocator::new(args.recv_frame_size, args.num_recv_frames),
            send_frames: FrameAllocator::new(args.send_frame_size, args.num_send_frames),
        })
    }
}

#[async_trait]
impl ZeroCopyTransport for UsbZeroCopy {
    async fn get_recv_buff(&self, timeout: Duration) -> Option<ManagedRecvBuffer> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut lease = self.recv_frames.acquire(timeout).await?;

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let buf = lease.buf_mut();
        match self.device.bulk_read(self.recv_endpoint, buf.raw_mut(), remaining).await {
            Ok(Some(len)) => {
                trace!("USB endpoint {:#04x}: received {} bytes", self.recv_endpoint, len);
                buf.set_len(len);
                Some(ManagedRecvBuffer::new(lease))
            }
            Ok(None) => None,
            Err(e) => {
                error!("USB endpoint {:#04x}: bulk read failed: {}", self.recv_endpoint, e);
                None
            }
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
