use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use crate::config::TransportArgs;
use crate::ctrl::{regs, RegisterIface};
use crate::error::TransportError;
use crate::factory::registry::TransportRegistry;
use crate::factory::TransportFactory;
use crate::packet::HeaderCodec;
use crate::sid::Sid;
use crate::xport::dma::{DmaDriver, DmaZeroCopy};
use crate::xport::muxed::MuxedTransport;
use crate::xport::{BothXports, XportPurpose, ZeroCopyTransport};

const CTRL_CHANNEL: u32 = 0;
const ASYNC_CHANNEL: u32 = 1;
const FIRST_DATA_CHANNEL: u32 = 2;

/// virtual streams per shared channel
const MAX_MUXED_STREAMS: usize = 64;
const DMA_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Transports over PCIe DMA channels.
///
/// Control and async message streams share the fixed channels 0 and 1, demultiplexed by SID.
///  Every data stream gets a dedicated channel, the first SID seen taking the next free one.
///  Channels are not reused within a session.
pub struct PcieTransportFactory {
    driver: Arc<dyn DmaDriver>,
    codec: HeaderCodec,
    shared: TransportRegistry<XportPurpose, Arc<MuxedTransport>>,
    data: TransportRegistry<Sid, Arc<DmaZeroCopy>>,
}

impl PcieTransportFactory {
    /// Make sure no DMA channel is left active by a previous session before handing out any
    pub async fn new(driver: Arc<dyn DmaDriver>, iface: &dyn RegisterIface, codec: HeaderCodec, ready_timeout: Duration) -> anyhow::Result<PcieTransportFactory> {
        Self::ensure_dma_ready(driver.as_ref(), iface, ready_timeout).await?;
        info!("PCIe transport factory with {} DMA channels", driver.num_channels());

        Ok(PcieTransportFactory {
            driver,
            codec,
            shared: Default::default(),
            data: Default::default(),
        })
    }

    async fn ensure_dma_ready(driver: &dyn DmaDriver, iface: &dyn RegisterIface, ready_timeout: Duration) -> anyhow::Result<()> {
        let status = iface.peek32(regs::DMA_STATUS).await?;
        if status == 0 {
            return Ok(());
        }

        warn!("DMA channels {:#x} are still active - stopping them", status);
        iface.poke32(regs::DMA_FIFO_CTRL, 0).await?;
        driver.stop_all_fifos().await?;

        let deadline = Instant::now() + ready_timeout;
        loop {
            tokio::time::sleep(DMA_POLL_INTERVAL).await;
            let status = iface.peek32(regs::DMA_STATUS).await?;
            if status == 0 {
                debug!("DMA channels stopped");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TransportError::DmaBusy.into());
            }
        }
    }

    async fn shared_stream(&self, sid: Sid, purpose: XportPurpose, args: &TransportArgs) -> anyhow::Result<Arc<dyn ZeroCopyTransport>> {
        let channel = match purpose {
            XportPurpose::Ctrl => CTRL_CHANNEL,
            _ => ASYNC_CHANNEL,
        };
        let driver = self.driver.clone();
        let codec = self.codec;
        let mux = self.shared.get_or_allocate(purpose, |_| Self::open_shared(driver, channel, codec, args)).await?;
        Ok(mux.make_stream(sid.reversed().to_raw())?)
    }

    async fn open_shared(driver: Arc<dyn DmaDriver>, channel: u32, codec: HeaderCodec, args: &TransportArgs) -> anyhow::Result<Arc<MuxedTransport>> {
        let base = DmaZeroCopy::open(driver, channel, args).await?;
        debug!("DMA channel {} is shared by SID", channel);
        Ok(MuxedTransport::new(Arc::new(base), Arc::new(move |frame: &[u8]| codec.extract_sid(frame).map(|s| s.to_raw())), MAX_MUXED_STREAMS))
    }

    async fn data_channel(&self, sid: Sid, args: &TransportArgs) -> anyhow::Result<Arc<DmaZeroCopy>> {
        let driver = self.driver.clone();
        self.data.get_or_allocate(sid, |num_allocated| Self::open_data(driver, sid, num_allocated, args)).await
    }

    async fn open_data(driver: Arc<dyn DmaDriver>, sid: Sid, num_allocated: usize, args: &TransportArgs) -> anyhow::Result<Arc<DmaZeroCopy>> {
        let num_channels = driver.num_channels();
        let channel = FIRST_DATA_CHANNEL as usize + num_allocated;
        if channel >= num_channels {
            return Err(TransportError::ResourceExhausted {
                resource: "DMA channel",
                sid,
                capacity: num_channels.saturating_sub(FIRST_DATA_CHANNEL as usize),
            }.into());
        }
        debug!("DMA channel {} for {}", channel, sid);
        Ok(Arc::new(DmaZeroCopy::open(driver, channel as u32, args).await?))
    }
}

#[async_trait]
impl TransportFactory for PcieTransportFactory {
    async fn make_transport(&self, sid: Sid, purpose: XportPurpose, args: &TransportArgs) -> anyhow::Result<BothXports> {
        let xport: Arc<dyn ZeroCopyTransport> = match purpose {
            XportPurpose::Ctrl | XportPurpose::AsyncMsg => self.shared_stream(sid, purpose, args).await?,
            XportPurpose::RxData | XportPurpose::TxData => self.data_channel(sid, args).await?,
        };

        Ok(BothXports {
            recv_buff_size: xport.recv_frame_size() * xport.num_recv_frames(),
            send_buff_size: xport.send_frame_size() * xport.num_send_frames(),
            recv: xport.clone(),
            send: xport,
            send_sid: sid,
            recv_sid: sid.reversed(),
        })
    }

    fn default_args(&self) -> TransportArgs {
        TransportArgs::default_pcie()
    }

    async fn shutdown(&self) {
        let num_data = self.data.release_all().await.len();
        let num_shared = self.shared.release_all().await.len();
        debug!("released {} data and {} shared DMA channels", num_data, num_shared);
    }
}
