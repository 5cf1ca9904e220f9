use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::{BufMut, Bytes};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};
use crate::xport::{FrameAllocator, FrameSink, ManagedRecvBuffer, ManagedSendBuffer, ZeroCopyTransport};

/// An in-process transport: two connected endpoints created by [MemoryZeroCopy::pair]. Frames
///  committed on one end are received on the other.
///
/// Like a real medium it is lossy when the receiver does not keep up: frames that do not fit
///  into the peer's queue are dropped.
pub struct MemoryZeroCopy {
    rx: Mutex<mpsc::Receiver<Bytes>>,
    sink: Arc<MemorySink>,
    recv_frames: FrameAllocator,
    send_frames: FrameAllocator,
}

struct MemorySink {
    tx: mpsc::Sender<Bytes>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        match self.tx.try_send(Bytes::copy_from_slice(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("peer queue is full - dropping frame");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(anyhow::anyhow!("peer endpoint was closed")),
        }
    }
}

impl MemoryZeroCopy {
    pub fn pair(frame_size: usize, num_frames: usize) -> (MemoryZeroCopy, MemoryZeroCopy) {
        let (tx_a, rx_a) = mpsc::channel(num_frames);
        let (tx_b, rx_b) = mpsc::channel(num_frames);

        (MemoryZeroCopy::new(rx_a, tx_b, frame_size, num_frames),
         MemoryZeroCopy::new(rx_b, tx_a, frame_size, num_frames))
    }

    fn new(rx: mpsc::Receiver<Bytes>, tx: mpsc::Sender<Bytes>, frame_size: usize, num_frames: usize) -> MemoryZeroCopy {
        MemoryZeroCopy {
            rx: Mutex::new(rx),
            sink: Arc::new(MemorySink { tx }),
            recv_frames: FrameAllocator::new(frame_size, num_frames),
            send_frames: FrameAllocator::new(frame_size, num_frames),
        }
    }

    /// convenience for tests and loopback setups: send a complete frame
    pub async fn send_bytes(&self, frame: &[u8], timeout: Duration) -> anyhow::Result<bool> {
        let Some(mut buf) = self.get_send_buff(timeout).await else {
            return Ok(false);
        };
        buf.buf_mut().put_slice(frame);
        buf.commit(frame.len()).await?;
        Ok(true)
    }
}

#[async_trait]
impl ZeroCopyTransport for MemoryZeroCopy {
    async fn get_recv_buff(&self, timeout: Duration) -> Option<ManagedRecvBuffer> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut lease = self.recv_frames.acquire(timeout).await?;

        let frame = tokio::time::timeout_at(deadline, async {
            self.rx.lock().await.recv().await
        }).await.ok()??;

        let len = frame.len().min(lease.buf().capacity());
        if len < frame.len() {
            debug!("truncating frame of {} bytes to the frame size of {}", frame.len(), len);
        }
        let buf = lease.buf_mut();
        buf.raw_mut()[..len].copy_from_slice(&frame[..len]);
        buf.set_len(len);
        trace!("received frame of {} bytes", len);
        Some(ManagedRecvBuffer::new(lease))
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
