use std::time::Duration;
use anyhow::bail;
use crate::convert::{CpuFormat, OtwFormat};

/// Per-stream framing and flow control parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamOptions {
    /// Maximum header length in bytes that TX packets may carry. The payload per packet is the
    ///  send frame size minus this.
    pub tx_max_len_hdr: usize,
    pub rx_max_len_hdr: usize,

    /// Number of flow control ACKs the host sends per full RX window. Higher values make the
    ///  device's view of the host buffer more accurate at the cost of upstream traffic.
    pub rx_fc_request_freq: usize,

    /// The device reports consumed TX packets every this many packets
    pub tx_fc_response_freq: usize,

    /// Consecutive TX timeouts waiting for flow control window space, without any ACK in
    ///  between, after which sending fails for good
    pub tx_max_fc_stalls: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            tx_max_len_hdr: 16,
            rx_max_len_hdr: 16,
            rx_fc_request_freq: 32,
            tx_fc_response_freq: 8,
            tx_max_fc_stalls: 10,
        }
    }
}

impl StreamOptions {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rx_fc_request_freq == 0 {
            bail!("rx_fc_request_freq must be at least 1");
        }
        if self.tx_fc_response_freq == 0 {
            bail!("tx_fc_response_freq must be at least 1");
        }
        if self.tx_max_fc_stalls == 0 {
            bail!("tx_max_fc_stalls must be at least 1");
        }
        Ok(())
    }
}

/// Buffer geometry requested from a transport factory
#[derive(Clone, Debug, PartialEq)]
pub struct TransportArgs {
    pub recv_frame_size: usize,
    pub send_frame_size: usize,
    pub num_recv_frames: usize,
    pub num_send_frames: usize,

    /// socket buffer sizes - only meaningful for network transports
    pub recv_buff_size: usize,
    pub send_buff_size: usize,

    /// receive data in a dedicated task, decoupling the medium from the application's polling
    pub recv_offload: bool,
    pub offload_queue_depth: usize,
}

impl TransportArgs {
    /// Ethernet defaults, assuming a 1500 byte MTU end to end
    pub fn default_eth() -> TransportArgs {
        TransportArgs {
            recv_frame_size: 1472,
            send_frame_size: 1472,
            num_recv_frames: 32,
            num_send_frames: 32,
            recv_buff_size: 2 * 1024 * 1024,
            send_buff_size: 2 * 1024 * 1024,
            recv_offload: false,
            offload_queue_depth: 32,
        }
    }

    pub fn default_pcie() -> TransportArgs {
        TransportArgs {
            recv_frame_size: 8192,
            send_frame_size: 8192,
            num_recv_frames: 256,
            num_send_frames: 256,
            recv_buff_size: 8192 * 256,
            send_buff_size: 8192 * 256,
            recv_offload: false,
            offload_queue_depth: 32,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recv_frame_size < 64 || self.send_frame_size < 64 {
            bail!("frame sizes must be at least 64 bytes (recv: {}, send: {})", self.recv_frame_size, self.send_frame_size);
        }
        if self.recv_frame_size % 4 != 0 || self.send_frame_size % 4 != 0 {
            bail!("frame sizes must be multiples of 4 bytes");
        }
        if self.num_recv_frames == 0 || self.num_send_frames == 0 {
            bail!("frame counts must be at least 1");
        }
        if self.recv_offload && self.offload_queue_depth == 0 {
            bail!("receive offload requires a queue depth of at least 1");
        }
        Ok(())
    }
}

/// Parameters of a device session
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// the major compat number of the FPGA image this host code speaks to
    pub fpga_compat_major: u32,

    pub async_queue_depth: usize,
    /// timeout of each receive attempt of the async drain task, i.e. its cancellation latency
    pub async_poll_interval: Duration,

    pub claim_refresh_interval: Duration,
    /// a claim that was not refreshed for this long is considered stale and may be taken over
    pub claim_staleness_timeout: Duration,

    pub ctrl_retries: usize,
    pub ctrl_timeout: Duration,

    /// size of the device's TX sample buffer in bytes, determining the TX flow control window
    pub tx_hw_buff_size: usize,
    /// size of the host's RX buffer in bytes, determining the RX flow control window
    pub rx_sw_buff_size: usize,

    /// tolerance in ticks when aligning the timestamps of multiple RX channels
    pub alignment_tolerance_ticks: u64,
    /// number of packets dropped per channel while trying to align before giving up
    pub alignment_max_attempts: usize,

    pub dma_ready_timeout: Duration,

    pub stream_options: StreamOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            fpga_compat_major: 35,
            async_queue_depth: 1000,
            async_poll_interval: Duration::from_millis(100),
            claim_refresh_interval: Duration::from_secs(1),
            claim_staleness_timeout: Duration::from_secs(2),
            ctrl_retries: 3,
            ctrl_timeout: Duration::from_secs(1),
            tx_hw_buff_size: 512 * 1024,
            rx_sw_buff_size: 8 * 1024 * 1024,
            alignment_tolerance_ticks: 0,
            alignment_max_attempts: 1000,
            dma_ready_timeout: Duration::from_secs(1),
            stream_options: StreamOptions::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.stream_options.validate()?;

        if self.async_queue_depth == 0 {
            bail!("async_queue_depth must be at least 1");
        }
        if self.async_poll_interval.is_zero() {
            bail!("async_poll_interval must be positive");
        }
        if self.claim_refresh_interval >= self.claim_staleness_timeout {
            bail!("claim_refresh_interval ({:?}) must be shorter than claim_staleness_timeout ({:?}), otherwise a live claim looks stale",
                self.claim_refresh_interval, self.claim_staleness_timeout);
        }
        if self.ctrl_retries == 0 {
            bail!("ctrl_retries must be at least 1");
        }
        if self.tx_hw_buff_size == 0 || self.rx_sw_buff_size == 0 {
            bail!("flow control buffer sizes must be positive");
        }
        Ok(())
    }
}

/// What an application asks for when it creates a streamer
#[derive(Clone, Debug, PartialEq)]
pub struct StreamArgs {
    pub cpu_format: CpuFormat,
    pub otw_format: OtwFormat,
    pub channels: Vec<usize>,
}

impl StreamArgs {
    pub fn new(cpu_format: CpuFormat, otw_format: OtwFormat) -> StreamArgs {
        StreamArgs {
            cpu_format,
            otw_format,
            channels: vec![0],
        }
    }

    pub fn with_channels(mut self, channels: Vec<usize>) -> StreamArgs {
        self.channels = channels;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channels.is_empty() {
            bail!("a streamer needs at least one channel");
        }
        for (i, ch) in self.channels.iter().enumerate() {
            if self.channels[..i].contains(ch) {
                bail!("channel {} is listed twice", ch);
            }
        }
        Ok(())
    }
}
