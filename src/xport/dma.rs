use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{debug, error, trace, warn};
use crate::config::TransportArgs;
use crate::xport::{FrameAllocator, FrameSink, ManagedRecvBuffer, ManagedSendBuffer, ZeroCopyTransport};

/// The user space session with the kernel-mode DMA driver. One channel is a pair of FIFOs, one
///  per direction.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DmaDriver: Send + Sync + 'static {
    fn num_channels(&self) -> usize;

    async fn configure_fifos(&self, channel: u32, frame_size: usize, num_recv_frames: usize, num_send_frames: usize) -> anyhow::Result<()>;
    async fn start_fifos(&self, channel: u32) -> anyhow::Result<()>;
    async fn stop_fifos(&self, channel: u32) -> anyhow::Result<()>;
    /// stop every FIFO the driver knows about, including those left running by a previous session
    async fn stop_all_fifos(&self) -> anyhow::Result<()>;

    /// Read one frame from the channel's device-to-host FIFO, `None` on timeout
    async fn read_frame(&self, channel: u32, buf: &mut [u8], timeout: Duration) -> anyhow::Result<Option<usize>>;
    async fn write_frame(&self, channel: u32, frame: &[u8]) -> anyhow::Result<()>;
}

/// A zero-copy transport over one DMA channel
pub struct DmaZeroCopy {
    driver: Arc<dyn DmaDriver>,
    channel: u32,
    sink: Arc<DmaSink>,
    recv_frames: FrameAllocator,
    send_frames: FrameAllocator,
}

struct DmaSink {
    driver: Arc<dyn DmaDriver>,
    channel: u32,
}

#[async_trait]
impl FrameSink for DmaSink {
    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        self.driver.write_frame(self.channel, frame).await
    }
}

impl DmaZeroCopy {
    pub async fn open(driver: Arc<dyn DmaDriver>, channel: u32, args: &TransportArgs) -> anyhow::Result<DmaZeroCopy> {
        args.validate()?;
        if channel as usize >= driver.num_channels() {
            anyhow::bail!("DMA channel {} does not exist, the driver has {} channels", channel, driver.num_channels());
        }

        driver.configure_fifos(channel, args.recv_frame_size.max(args.send_frame_size), args.num_recv_frames, args.num_send_frames).await?;
        driver.start_fifos(channel).await?;
        debug!("opened DMA channel {}", channel);

        Ok(DmaZeroCopy {
            sink: Arc::new(DmaSink { driver: driver.clone(), channel }),
            driver,
            channel,
            recv_frames: FrameAllocator::new(args.recv_frame_size, args.num_recv_frames),
            send_frames: FrameAllocator::new(args.send_frame_size, args.num_send_frames),
        })
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }
}

impl Drop for DmaZeroCopy {
    fn drop(&mut self) {
        let driver = self.driver.clone();
        let channel = self.channel;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = driver.stop_fifos(channel).await {
                        warn!("error stopping DMA channel {}: {}", channel, e);
                    }
                });
            }
            Err(_) => warn!("DMA channel {} dropped outside a runtime - FIFOs stay active until the next session resets them", channel),
        }
    }
}

#[async_trait]
impl ZeroCopyTransport for DmaZeroCopy {
    async fn get_recv_buff(&self, timeout: Duration) -> Option<ManagedRecvBuffer> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut lease = self.recv_frames.acquire(timeout).await?;

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let buf = lease.buf_mut();
        match self.driver.read_frame(self.channel, buf.raw_mut(), remaining).await {
            Ok(Some(len)) => {
                trace!("DMA channel {}: received {} bytes", self.channel, len);
                buf.set_len(len);
                Some(ManagedRecvBuffer::new(lease))
            }
            Ok(None) => None,
            Err(e) => {
                error!("DMA channel {}: read failed: {}", self.channel, e);
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

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use mockall::predicate::eq;
    use tokio::runtime::Builder;

    fn driver_for_channel(channel: u32) -> MockDmaDriver {
        let mut driver = MockDmaDriver::new();
        driver.expect_num_channels().return_const(6usize);
        driver.expect_configure_fifos()
            .with(eq(channel), eq(8192), eq(256), eq(256))
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        driver.expect_start_fifos()
            .with(eq(channel))
            .times(1)
            .returning(|_| Ok(()));
        driver
    }

    #[test]
    fn test_recv_and_send() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut driver = driver_for_channel(3);
            driver.expect_read_frame()
                .times(1)
                .returning(|_, buf, _| {
                    buf[..3].copy_from_slice(b"abc");
                    Ok(Some(3))
                });
            driver.expect_write_frame()
                .withf(|channel, frame| *channel == 3 && frame.to_vec() == b"xyz".to_vec())
                .times(1)
                .returning(|_, _| Ok(()));
            driver.expect_stop_fifos().returning(|_| Ok(()));

            let xport = DmaZeroCopy::open(Arc::new(driver), 3, &TransportArgs::default_pcie()).await.unwrap();
            assert_eq!(xport.get_recv_buff(Duration::from_millis(10)).await.unwrap().as_ref(), b"abc");

            let mut buf = xport.get_send_buff(Duration::from_millis(10)).await.unwrap();
            buf.buf_mut().put_slice(b"xyz");
            buf.commit(3).await.unwrap();
        });
    }

    #[test]
    fn test_read_timeout() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut driver = driver_for_channel(0);
            driver.expect_read_frame().returning(|_, _, _| Ok(None));
            driver.expect_stop_fifos().returning(|_| Ok(()));

            let xport = DmaZeroCopy::open(Arc::new(driver), 0, &TransportArgs::default_pcie()).await.unwrap();
            assert!(xport.get_recv_buff(Duration::from_millis(10)).await.is_none());
        });
    }

    #[test]
    fn test_invalid_channel() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut driver = MockDmaDriver::new();
            driver.expect_num_channels().return_const(6usize);
            assert!(DmaZeroCopy::open(Arc::new(driver), 6, &TransportArgs::default_pcie()).await.is_err());
        });
    }
}
