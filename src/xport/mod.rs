//! Zero-copy transports: the leaf abstraction for moving frames between host and device.
//!
//! A transport hands out *managed buffers* - pooled, fixed-size frames that are returned to
//!  their pool when dropped. The number of frames a transport has in use per direction is bounded
//!  by its frame count, so holding on to received buffers eventually stalls reception instead of
//!  growing memory.
//!
//! All acquisition operations take an explicit timeout and return `None` when it expires.
//!
//! Implementations are independent types composed rather than layered through inheritance:
//!  [offload::RecvOffload] and [muxed::MuxedTransport] wrap any other transport.

pub mod benchmark;
pub mod dma;
pub mod memory;
pub mod muxed;
pub mod offload;
pub mod udp;
pub mod usb;

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::sid::Sid;


#[async_trait]
pub trait ZeroCopyTransport: Send + Sync + 'static {
    async fn get_recv_buff(&self, timeout: Duration) -> Option<ManagedRecvBuffer>;
    async fn get_send_buff(&self, timeout: Duration) -> Option<ManagedSendBuffer>;

    fn num_recv_frames(&self) -> usize;
    fn recv_frame_size(&self) -> usize;
    fn num_send_frames(&self) -> usize;
    fn send_frame_size(&self) -> usize;
}

/// The medium-specific part of sending: a committed send buffer's bytes end up here
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()>;
}

/// Pooled frames plus a limit on the number of frames in use
pub struct FrameAllocator {
    pool: Arc<BufferPool>,
    frames: Arc<Semaphore>,
    num_frames: usize,
}

impl FrameAllocator {
    pub fn new(frame_size: usize, num_frames: usize) -> FrameAllocator {
        FrameAllocator {
            pool: Arc::new(BufferPool::new(frame_size, num_frames)),
            frames: Arc::new(Semaphore::new(num_frames)),
            num_frames,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.pool.frame_size()
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Wait for a free frame until the deadline. The returned lease keeps its frame slot
    ///  occupied until it is dropped.
    pub async fn acquire(&self, timeout: Duration) -> Option<FrameLease> {
        let permit = match tokio::time::timeout(timeout, self.frames.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return None,
            Err(_) => {
                trace!("no free frame within {:?}", timeout);
                return None;
            }
        };

        Some(FrameLease {
            buf: self.pool.get_from_pool(),
            pool: self.pool.clone(),
            _permit: permit,
        })
    }
}

/// A frame taken from a [FrameAllocator], returned to it on drop
pub struct FrameLease {
    buf: FixedBuf,
    pool: Arc<BufferPool>,
    _permit: OwnedSemaphorePermit,
}

impl FrameLease {
    pub fn buf(&self) -> &FixedBuf {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut FixedBuf {
        &mut self.buf
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        let buf = std::mem::replace(&mut self.buf, FixedBuf::new(0));
        self.pool.return_to_pool(buf);
    }
}

/// A received frame. Its bytes are the frame's payload as received from the medium.
pub struct ManagedRecvBuffer {
    lease: FrameLease,
}

impl ManagedRecvBuffer {
    pub fn new(lease: FrameLease) -> ManagedRecvBuffer {
        ManagedRecvBuffer { lease }
    }

    pub fn len(&self) -> usize {
        self.lease.buf().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lease.buf().is_empty()
    }
}

impl AsRef<[u8]> for ManagedRecvBuffer {
    fn as_ref(&self) -> &[u8] {
        self.lease.buf().as_ref()
    }
}

impl Debug for ManagedRecvBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ManagedRecvBuffer[{} bytes]", self.len())
    }
}

/// A frame to be filled and then [committed](ManagedSendBuffer::commit). Dropping it without
///  committing releases the frame without sending anything.
pub struct ManagedSendBuffer {
    lease: FrameLease,
    sink: Arc<dyn FrameSink>,
}

impl ManagedSendBuffer {
    pub fn new(lease: FrameLease, sink: Arc<dyn FrameSink>) -> ManagedSendBuffer {
        ManagedSendBuffer { lease, sink }
    }

    pub fn capacity(&self) -> usize {
        self.lease.buf().capacity()
    }

    /// The frame as a `BufMut`, starting out empty
    pub fn buf_mut(&mut self) -> &mut FixedBuf {
        self.lease.buf_mut()
    }

    /// Send the first `len` bytes of the frame
    pub async fn commit(mut self, len: usize) -> anyhow::Result<()> {
        let buf = self.lease.buf_mut();
        buf.set_len(len);
        self.sink.send_frame(buf.as_ref()).await
    }
}

impl Debug for ManagedSendBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ManagedSendBuffer[{} of {} bytes]", self.lease.buf().len(), self.capacity())
    }
}

/// What a transport is used for - this determines how a factory allocates it
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum XportPurpose {
    Ctrl,
    AsyncMsg,
    TxData,
    RxData,
}

/// The transports of one logical stream, as produced by a transport factory.
#[derive(Clone)]
pub struct BothXports {
    pub recv: Arc<dyn ZeroCopyTransport>,
    pub send: Arc<dyn ZeroCopyTransport>,
    pub recv_buff_size: usize,
    pub send_buff_size: usize,
    /// the SID of packets the host sends
    pub send_sid: Sid,
    /// the SID of packets the host receives, i.e. `send_sid.reversed()`
    pub recv_sid: Sid,
}

impl Debug for BothXports {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BothXports[send: {}, recv: {}, buffers {}/{}]", self.send_sid, self.recv_sid, self.send_buff_size, self.recv_buff_size)
    }
}
