//! A device session: everything the streamers of one device share.
//!
//! Opening a session claims the device, checks the FPGA compat number and starts draining async
//!  messages. Streamers are created through the session, which keeps only weak references to
//!  them: the application owns its streamers, and the session notifies those still alive when
//!  the tick rate or a sample rate changes.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use crate::async_msg::{AsyncMsgDrain, AsyncMsgQueue, AsyncMsgRouter, AsyncMsgSink};
use crate::config::{SessionConfig, StreamArgs, TransportArgs};
use crate::convert::CpuSample;
use crate::ctrl::claim::Claimer;
use crate::ctrl::{check_fpga_compat, RegisterIface};
use crate::error::TransportError;
use crate::factory::{SidFramer, TransportFactory};
use crate::metadata::AsyncMetadata;
use crate::packet::HeaderCodec;
use crate::radio::RadioCtrl;
use crate::streamer::rx::{AlignmentConfig, RxStreamer};
use crate::streamer::tx::TxStreamer;
use crate::streamer::{StreamChannel, StreamRates, StreamerHandle, StreamerSetup};
use crate::xport::XportPurpose;

/// Weak references to the streamers of one direction, plus the sample rate they run at
struct StreamerSet {
    samp_rate: f64,
    streamers: Vec<Weak<dyn StreamerHandle>>,
}

impl StreamerSet {
    fn new(samp_rate: f64) -> StreamerSet {
        StreamerSet {
            samp_rate,
            streamers: Vec::new(),
        }
    }

    /// the streamers that are still alive, forgetting the others
    fn live(&mut self) -> Vec<Arc<dyn StreamerHandle>> {
        self.streamers.retain(|w| w.strong_count() > 0);
        self.streamers.iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }
}

pub struct DeviceSession {
    config: SessionConfig,
    codec: HeaderCodec,
    framer: SidFramer,
    transport_args: TransportArgs,
    factory: Arc<dyn TransportFactory>,
    radio: Arc<dyn RadioCtrl>,
    claimer: Claimer,
    async_sink: AsyncMsgSink,
    async_drain: AsyncMsgDrain,
    tick_rate: watch::Sender<f64>,
    rx: Mutex<StreamerSet>,
    tx: Mutex<StreamerSet>,
}

impl DeviceSession {
    pub async fn open(config: SessionConfig, ctrl: Arc<dyn RegisterIface>, factory: Arc<dyn TransportFactory>,
                      radio: Arc<dyn RadioCtrl>, codec: HeaderCodec, framer: SidFramer) -> anyhow::Result<DeviceSession> {
        config.validate()?;

        let claimer = Claimer::claim(ctrl.clone(), config.claim_refresh_interval, config.claim_staleness_timeout).await?;
        if let Err(e) = check_fpga_compat(ctrl.as_ref(), config.fpga_compat_major).await {
            if let Err(release_error) = claimer.release().await {
                warn!("error releasing the device claim: {}", release_error);
            }
            return Err(e);
        }

        let transport_args = factory.default_args();
        let async_xports = factory.make_transport(framer.send_sid(XportPurpose::AsyncMsg, 0), XportPurpose::AsyncMsg, &transport_args).await?;

        let (tick_rate, tick_rate_rx) = watch::channel(radio.tick_rate());
        let async_sink = AsyncMsgSink {
            codec,
            tick_rate: tick_rate_rx,
            queue: Arc::new(AsyncMsgQueue::new(config.async_queue_depth)),
            router: Arc::new(AsyncMsgRouter::default()),
            poll_interval: config.async_poll_interval,
        };
        let async_drain = AsyncMsgDrain::spawn(async_xports.recv, &async_sink);

        let samp_rate = radio.tick_rate();
        info!("opened device session: claim token {:#010x}, tick rate {}", claimer.token(), samp_rate);

        Ok(DeviceSession {
            config,
            codec,
            framer,
            transport_args,
            factory,
            radio,
            claimer,
            async_sink,
            async_drain,
            tick_rate,
            rx: Mutex::new(StreamerSet::new(samp_rate)),
            tx: Mutex::new(StreamerSet::new(samp_rate)),
        })
    }

    fn check_cpu_format<S: CpuSample>(args: &StreamArgs) -> anyhow::Result<()> {
        args.validate()?;
        if args.cpu_format != S::FORMAT {
            return Err(TransportError::InvalidArgument(format!("stream args ask for {:?} samples, but the streamer is typed for {:?}", args.cpu_format, S::FORMAT)).into());
        }
        Ok(())
    }

    async fn stream_channels(&self, purpose: XportPurpose, args: &StreamArgs) -> anyhow::Result<Vec<StreamChannel>> {
        let mut channels = Vec::with_capacity(args.channels.len());
        for &channel in &args.channels {
            let xports = self.factory.make_transport(self.framer.send_sid(purpose, channel), purpose, &self.transport_args).await?;
            channels.push(StreamChannel { channel, xports });
        }
        Ok(channels)
    }

    fn setup(&self, args: &StreamArgs, samp_rate: f64) -> StreamerSetup {
        StreamerSetup {
            codec: self.codec,
            otw_format: args.otw_format,
            rates: StreamRates { tick_rate: self.radio.tick_rate(), samp_rate },
            options: self.config.stream_options.clone(),
        }
    }

    pub async fn get_rx_stream<S: CpuSample>(&self, args: &StreamArgs) -> anyhow::Result<Arc<RxStreamer<S>>> {
        Self::check_cpu_format::<S>(args)?;

        let mut channels = self.stream_channels(XportPurpose::RxData, args).await?;
        for ch in channels.iter_mut() {
            ch.xports.recv_buff_size = ch.xports.recv_buff_size.min(self.config.rx_sw_buff_size);
        }

        let samp_rate = self.rx.lock().unwrap().samp_rate;
        let alignment = AlignmentConfig {
            tolerance_ticks: self.config.alignment_tolerance_ticks,
            max_attempts: self.config.alignment_max_attempts,
        };
        let streamer = Arc::new(RxStreamer::new(self.setup(args, samp_rate), channels, self.radio.clone(), alignment).await?);

        let handle: Weak<dyn StreamerHandle> = Arc::downgrade(&streamer) as Weak<_>;
        self.rx.lock().unwrap().streamers.push(handle);
        debug!("created RX streamer for channels {:?}", args.channels);
        Ok(streamer)
    }

    pub async fn get_tx_stream<S: CpuSample>(&self, args: &StreamArgs) -> anyhow::Result<Arc<TxStreamer<S>>> {
        Self::check_cpu_format::<S>(args)?;

        let channels = self.stream_channels(XportPurpose::TxData, args).await?;
        let samp_rate = self.tx.lock().unwrap().samp_rate;
        let streamer = Arc::new(TxStreamer::new(self.setup(args, samp_rate), channels, self.radio.clone(), self.async_sink.clone(),
                                                self.config.tx_hw_buff_size).await?);

        let handle: Weak<dyn StreamerHandle> = Arc::downgrade(&streamer) as Weak<_>;
        self.tx.lock().unwrap().streamers.push(handle);
        debug!("created TX streamer for channels {:?}", args.channels);
        Ok(streamer)
    }

    /// Wait up to `timeout` for the next async device event
    pub async fn recv_async_msg(&self, timeout: Duration) -> Option<AsyncMetadata> {
        self.async_sink.queue.pop(timeout).await
    }

    pub fn update_rx_samp_rate(&self, samp_rate: f64) {
        let mut rx = self.rx.lock().unwrap();
        rx.samp_rate = samp_rate;
        for s in rx.live() {
            s.set_samp_rate(samp_rate);
        }
    }

    pub fn update_tx_samp_rate(&self, samp_rate: f64) {
        let mut tx = self.tx.lock().unwrap();
        tx.samp_rate = samp_rate;
        for s in tx.live() {
            s.set_samp_rate(samp_rate);
        }
    }

    pub fn update_tick_rate(&self, tick_rate: f64) {
        info!("tick rate is now {}", tick_rate);
        self.radio.set_tick_rate(tick_rate);
        self.tick_rate.send_replace(tick_rate);
        for s in self.live_rx_streamers().into_iter().chain(self.live_tx_streamers()) {
            s.set_tick_rate(tick_rate);
        }
    }

    pub fn live_rx_streamers(&self) -> Vec<Arc<dyn StreamerHandle>> {
        self.rx.lock().unwrap().live()
    }

    pub fn live_tx_streamers(&self) -> Vec<Arc<dyn StreamerHandle>> {
        self.tx.lock().unwrap().live()
    }

    pub fn claim_token(&self) -> u32 {
        self.claimer.token()
    }

    /// Stop the async message drain, release all transports and the device claim
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let DeviceSession { factory, claimer, async_drain, .. } = self;
        drop(async_drain);
        factory.shutdown().await;
        claimer.release().await?;
        info!("device session closed");
        Ok(())
    }
}
