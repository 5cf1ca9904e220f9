use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::convert::{Converter, CpuSample};
use crate::error::TransportError;
use crate::flow_control::rx::{RxFlowControl, SeqCheck};
use crate::metadata::{RxErrorCode, RxMetadata};
use crate::packet::{HeaderCodec, HeaderFormat, IfPacketInfo, PacketType};
use crate::radio::RadioCtrl;
use crate::stream_cmd::{StreamCmd, StreamMode};
use crate::streamer::{StreamChannel, StreamRates, StreamerHandle, StreamerSetup};
use crate::time_spec::TimeSpec;
use crate::util::buf_ext::BufExt;
use crate::xport::{ManagedRecvBuffer, ZeroCopyTransport};

/// How hard a multi-channel streamer tries to line up its channels' timestamps
#[derive(Clone, Debug, PartialEq)]
pub struct AlignmentConfig {
    pub tolerance_ticks: u64,
    /// number of packets dropped while aligning before an alignment error is reported
    pub max_attempts: usize,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        AlignmentConfig {
            tolerance_ticks: 0,
            max_attempts: 1000,
        }
    }
}

enum SeqTracker {
    /// CHDR: sequence numbers are checked, and consumed packets are reported to the device
    FlowControlled(RxFlowControl),
    /// VRT: the 4 bit packet count is checked, the device is not flow controlled
    PacketCount(Option<u16>),
}

impl SeqTracker {
    /// returns true if packets were lost before this one
    fn on_packet(&mut self, count: u16) -> bool {
        match self {
            SeqTracker::FlowControlled(fc) => matches!(fc.on_packet(count), SeqCheck::Gap { .. }),
            SeqTracker::PacketCount(last) => {
                let count = count & 0xf;
                let expected = last.map(|l| (l + 1) & 0xf);
                *last = Some(count);
                match expected {
                    Some(expected) if expected != count => {
                        debug!("D: packet count gap, expected {} but got {}", expected, count);
                        true
                    }
                    _ => false,
                }
            }
        }
    }
}

/// A received data packet, possibly partially handed out already
struct RxPacket {
    buf: ManagedRecvBuffer,
    info: IfPacketInfo,
    num_samps: usize,
    offset: usize,
}

impl RxPacket {
    fn remaining(&self) -> usize {
        self.num_samps - self.offset
    }

    fn payload(&self) -> &[u8] {
        let start = self.info.header_len_bytes();
        &self.buf.as_ref()[start..start + self.info.num_payload_bytes]
    }

    fn ticks_at_offset(&self, rates: &StreamRates) -> Option<u64> {
        self.info.tsf.map(|tsf| rates.ticks_at(tsf, self.offset))
    }
}

struct RxChannel {
    channel: usize,
    recv: Arc<dyn ZeroCopyTransport>,
    seq: SeqTracker,
    current: Option<RxPacket>,
}

struct RxState {
    channels: Vec<RxChannel>,
    /// an error condition that was detected while a call already had samples to return
    pending: Option<RxMetadata>,
}

/// Receives samples of one or more channels.
///
/// Wire packets are handed out in fragments if the caller's buffer is smaller than a packet.
///  Device conditions (overflow, late command, broken chain) and timeouts are reported through
///  [RxMetadata::error_code] with a sample count of 0; the packet that revealed a sequence gap is
///  kept and delivered by the next call.
pub struct RxStreamer<S: CpuSample> {
    state: tokio::sync::Mutex<RxState>,
    channels: Vec<usize>,
    radio: Arc<dyn RadioCtrl>,
    codec: HeaderCodec,
    converter: Converter,
    rates: Mutex<StreamRates>,
    alignment: AlignmentConfig,
    max_samps_per_packet: usize,
    _samples: PhantomData<fn() -> S>,
}

impl<S: CpuSample> RxStreamer<S> {
    /// delay for starting multiple channels at the same time with a 'now' command
    const MULTI_CHANNEL_START_DELAY: f64 = 0.05;

    pub async fn new(setup: StreamerSetup, channels: Vec<StreamChannel>, radio: Arc<dyn RadioCtrl>, alignment: AlignmentConfig) -> anyhow::Result<RxStreamer<S>> {
        if channels.is_empty() {
            return Err(TransportError::InvalidArgument("an RX streamer needs at least one channel".to_string()).into());
        }

        let mut max_samps_per_packet = usize::MAX;
        let mut rx_channels = Vec::with_capacity(channels.len());
        for ch in channels {
            let frame_size = ch.xports.recv.recv_frame_size();
            let samps = setup.otw_format.num_samps(frame_size.saturating_sub(setup.options.rx_max_len_hdr));
            if samps == 0 {
                return Err(TransportError::InvalidArgument(format!("RX frames of {} bytes leave no room for samples after a header of up to {} bytes", frame_size, setup.options.rx_max_len_hdr)).into());
            }
            max_samps_per_packet = max_samps_per_packet.min(samps);

            let seq = match setup.codec.format {
                HeaderFormat::Chdr => {
                    let window = (ch.xports.recv_buff_size / frame_size).max(1);
                    let ack_every = RxFlowControl::ack_interval(window, setup.options.rx_fc_request_freq);
                    radio.setup_rx_flow_control(ch.channel, ch.xports.recv_sid, window, ack_every).await?;
                    debug!("RX channel {} on {}: window of {} packets, ACK every {}", ch.channel, ch.xports.recv_sid, window, ack_every);
                    SeqTracker::FlowControlled(RxFlowControl::new(ch.xports.send.clone(), setup.codec, ch.xports.recv_sid, ack_every))
                }
                HeaderFormat::Vrt => {
                    debug!("RX channel {} on {}", ch.channel, ch.xports.recv_sid);
                    SeqTracker::PacketCount(None)
                }
            };

            rx_channels.push(RxChannel {
                channel: ch.channel,
                recv: ch.xports.recv,
                seq,
                current: None,
            });
        }

        Ok(RxStreamer {
            channels: rx_channels.iter().map(|c| c.channel).collect(),
            state: tokio::sync::Mutex::new(RxState {
                channels: rx_channels,
                pending: None,
            }),
            radio,
            codec: setup.codec,
            converter: Converter::new(setup.otw_format, setup.codec.endianness),
            rates: Mutex::new(setup.rates),
            alignment,
            max_samps_per_packet,
            _samples: PhantomData,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// the number of samples in a full wire packet
    pub fn max_num_samps(&self) -> usize {
        self.max_samps_per_packet
    }

    /// Issue a stream command to all channels. With more than one channel, a command to start
    ///  'now' is turned into a timed command so that the channels start aligned.
    pub async fn issue_stream_cmd(&self, cmd: &StreamCmd) -> anyhow::Result<()> {
        let mut cmd = cmd.clone();
        if self.channels.len() > 1 && cmd.stream_now && cmd.mode != StreamMode::StopContinuous {
            let now = self.radio.get_time_now().await?;
            cmd = cmd.at(now + TimeSpec::from_secs_f64(Self::MULTI_CHANNEL_START_DELAY));
        }
        for &channel in &self.channels {
            self.radio.issue_stream_cmd(channel, &cmd).await?;
        }
        Ok(())
    }

    /// Receive up to the length of the shortest buffer, one buffer per channel. Returns the
    ///  number of samples per channel, 0 on timeout or error.
    ///
    /// With `one_packet`, at most one wire packet's worth of samples is returned. A packet with
    ///  the end-of-burst flag always ends the call.
    ///
    /// Fails only for a number of buffers that does not match the number of channels.
    pub async fn recv(&self, buffs: &mut [&mut [S]], metadata: &mut RxMetadata, timeout: Duration, one_packet: bool) -> anyhow::Result<usize> {
        if buffs.len() != self.channels.len() {
            return Err(TransportError::InvalidArgument(format!("recv() requires one buffer per channel: got {} buffers for {} channels", buffs.len(), self.channels.len())).into());
        }
        Ok(self.recv_all_channels(buffs, metadata, timeout, one_packet).await)
    }

    async fn recv_all_channels(&self, buffs: &mut [&mut [S]], metadata: &mut RxMetadata, timeout: Duration, one_packet: bool) -> usize {
        metadata.reset();

        let deadline = Instant::now() + timeout;
        let rates = *self.rates.lock().unwrap();
        let nsamps = buffs.iter().map(|b| b.len()).min().unwrap_or(0);

        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending.take() {
            *metadata = pending;
            return 0;
        }

        let mut total = 0;
        while total < nsamps {
            if let Err(error_md) = self.fill_current(&mut state.channels, deadline, &rates).await {
                if total == 0 {
                    *metadata = error_md;
                }
                else if error_md.error_code != RxErrorCode::Timeout {
                    state.pending = Some(error_md);
                }
                break;
            }

            let mut packets = state.channels.iter_mut()
                .filter_map(|c| c.current.as_mut())
                .collect::<Vec<_>>();
            let Some(avail) = packets.iter().map(|p| p.remaining()).min() else {
                break;
            };
            let n = avail.min(nsamps - total);

            if total == 0 {
                let first = &packets[0];
                metadata.has_time_spec = first.info.tsf.is_some();
                metadata.time_spec = first.info.tsf.map(|tsf| rates.time_at(tsf, first.offset)).unwrap_or_default();
                metadata.start_of_burst = first.info.sob && first.offset == 0;
                metadata.fragment_offset = first.offset;
            }

            let mut conversion_error = false;
            for (p, buf) in packets.iter_mut().zip(buffs.iter_mut()) {
                if let Err(e) = self.converter.unpack(p.payload(), p.offset, &mut buf[total..total + n]) {
                    warn!("error converting samples: {}", e);
                    conversion_error = true;
                }
                p.offset += n;
            }
            let packet_done = packets[0].remaining() == 0;
            let eob = packet_done && packets[0].info.eob;
            drop(packets);

            for ch in state.channels.iter_mut() {
                if ch.current.as_ref().is_some_and(|p| p.remaining() == 0) || conversion_error {
                    ch.current = None;
                }
            }
            if conversion_error {
                metadata.error_code = RxErrorCode::BadPacket;
                return total;
            }

            total += n;
            metadata.more_fragments = !packet_done;
            metadata.end_of_burst = eob;
            if eob || one_packet {
                break;
            }
        }
        trace!("received {} samples per channel", total);
        total
    }

    /// Make sure every channel has a current packet and that they are time aligned. On failure,
    ///  the metadata describing the failure is returned.
    async fn fill_current(&self, channels: &mut [RxChannel], deadline: Instant, rates: &StreamRates) -> Result<(), RxMetadata> {
        let mut attempts = 0;
        loop {
            for ch in channels.iter_mut() {
                if ch.current.is_none() {
                    self.next_packet(ch, deadline, rates).await?;
                }
            }
            if channels.len() == 1 {
                return Ok(());
            }

            let ticks = channels.iter()
                .map(|c| c.current.as_ref().and_then(|p| p.ticks_at_offset(rates)))
                .collect::<Option<Vec<_>>>();
            let Some(ticks) = ticks else {
                // without timestamps, there is nothing to align by
                return Ok(());
            };
            let newest = ticks.iter().copied().max().unwrap_or(0);
            let oldest = ticks.iter().copied().min().unwrap_or(0);
            if newest - oldest <= self.alignment.tolerance_ticks {
                return Ok(());
            }

            attempts += 1;
            if attempts > self.alignment.max_attempts {
                warn!("could not align {} channels after {} attempts", channels.len(), self.alignment.max_attempts);
                for ch in channels.iter_mut() {
                    ch.current = None;
                }
                return Err(RxMetadata {
                    error_code: RxErrorCode::Alignment,
                    ..RxMetadata::default()
                });
            }

            trace!("aligning channels: timestamps {:?}", ticks);
            for (ch, t) in channels.iter_mut().zip(ticks) {
                if t + self.alignment.tolerance_ticks < newest {
                    ch.current = None;
                }
            }
        }
    }

    async fn next_packet(&self, ch: &mut RxChannel, deadline: Instant, rates: &StreamRates) -> Result<(), RxMetadata> {
        loop {
            let Some(buf) = ch.recv.get_recv_buff(deadline.saturating_duration_since(Instant::now())).await else {
                return Err(RxMetadata {
                    error_code: RxErrorCode::Timeout,
                    ..RxMetadata::default()
                });
            };

            let info = match self.codec.unpack(buf.as_ref()) {
                Ok(info) => info,
                Err(e) => {
                    warn!("dropping malformed packet on channel {}: {}", ch.channel, e);
                    return Err(RxMetadata {
                        error_code: RxErrorCode::BadPacket,
                        ..RxMetadata::default()
                    });
                }
            };

            match info.packet_type {
                PacketType::Data => {}
                PacketType::Error | PacketType::Response | PacketType::Context => {
                    return Err(self.inband_error(ch.channel, &buf, &info, rates));
                }
                other => {
                    trace!("ignoring {:?} packet on channel {}", other, ch.channel);
                    continue;
                }
            }

            let gap = ch.seq.on_packet(info.packet_count);
            let num_samps = self.converter.otw.num_samps(info.num_payload_bytes);
            let tsf = info.tsf;
            ch.current = Some(RxPacket { buf, info, num_samps, offset: 0 });

            if gap {
                // the packet that revealed the gap is kept for the next call
                return Err(RxMetadata {
                    has_time_spec: tsf.is_some(),
                    time_spec: tsf.map(|t| rates.time_at(t, 0)).unwrap_or_default(),
                    error_code: RxErrorCode::Overflow,
                    out_of_sequence: true,
                    ..RxMetadata::default()
                });
            }
            return Ok(());
        }
    }

    /// decode a packet the device sends in-band to report an error condition
    fn inband_error(&self, channel: usize, buf: &ManagedRecvBuffer, info: &IfPacketInfo, rates: &StreamRates) -> RxMetadata {
        let mut payload = &buf.as_ref()[info.header_len_bytes()..];
        let error_code = match payload.try_get_word32(self.codec.endianness) {
            Ok(word) => RxErrorCode::from_wire(word),
            Err(_) => RxErrorCode::BadPacket,
        };
        match error_code {
            RxErrorCode::Overflow => debug!("O"),
            other => debug!("channel {} reports {}", channel, other),
        }

        RxMetadata {
            has_time_spec: info.tsf.is_some(),
            time_spec: info.tsf.map(|t| rates.time_at(t, 0)).unwrap_or_default(),
            error_code,
            ..RxMetadata::default()
        }
    }
}

impl<S: CpuSample> StreamerHandle for RxStreamer<S> {
    fn channels(&self) -> Vec<usize> {
        self.channels.clone()
    }

    fn set_tick_rate(&self, tick_rate: f64) {
        self.rates.lock().unwrap().tick_rate = tick_rate;
    }

    fn set_samp_rate(&self, samp_rate: f64) {
        self.rates.lock().unwrap().samp_rate = samp_rate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::config::StreamOptions;
    use crate::convert::{OtwFormat, Sc16};
    use crate::packet::Endianness;
    use crate::radio::MockRadioCtrl;
    use crate::sid::Sid;
    use crate::xport::BothXports;
    use crate::xport::memory::MemoryZeroCopy;

    const FRAME_SIZE: usize = 256;
    const NUM_FRAMES: usize = 16;

    fn codec() -> HeaderCodec {
        HeaderCodec::chdr(Endianness::Big)
    }

    fn setup() -> StreamerSetup {
        StreamerSetup {
            codec: codec(),
            otw_format: OtwFormat::Sc16,
            rates: StreamRates { tick_rate: 100.0, samp_rate: 100.0 },
            options: StreamOptions::default(),
        }
    }

    fn samps(first: i16, n: usize) -> Vec<Sc16> {
        (0..n as i16).map(|i| Sc16 { re: first + i, im: -(first + i) }).collect()
    }

    fn data_packet(sid: Sid, seq: u16, tsf: Option<u64>, samples: &[Sc16], eob: bool) -> Vec<u8> {
        let conv = Converter::new(OtwFormat::Sc16, Endianness::Big);
        let mut info = IfPacketInfo::data(sid);
        info.packet_count = seq;
        info.tsf = tsf;
        info.eob = eob;
        info.num_payload_bytes = OtwFormat::Sc16.num_bytes(samples.len());

        let mut frame = Vec::new();
        codec().pack(&mut info, &mut frame).unwrap();
        conv.pack(samples, &mut frame).unwrap();
        frame
    }

    fn error_packet(sid: Sid, code: u32, tsf: Option<u64>) -> Vec<u8> {
        let mut info = IfPacketInfo::new(PacketType::Error, sid);
        info.tsf = tsf;
        info.num_payload_bytes = 4;
        let mut frame = Vec::new();
        codec().pack(&mut info, &mut frame).unwrap();
        frame.extend_from_slice(&code.to_be_bytes());
        frame
    }

    fn sid(channel: usize) -> Sid {
        Sid::new(0x02, channel as u8, 0x00, 0x10)
    }

    fn radio() -> MockRadioCtrl {
        let mut radio = MockRadioCtrl::new();
        radio.expect_setup_rx_flow_control().returning(|_, _, _, _| Ok(()));
        radio
    }

    /// device endpoints plus the streamer receiving from them
    async fn streamer(num_channels: usize, radio: MockRadioCtrl, alignment: AlignmentConfig) -> (Vec<MemoryZeroCopy>, RxStreamer<Sc16>) {
        let mut devices = Vec::new();
        let mut channels = Vec::new();
        for channel in 0..num_channels {
            let (device, host) = MemoryZeroCopy::pair(FRAME_SIZE, NUM_FRAMES);
            let host: Arc<dyn ZeroCopyTransport> = Arc::new(host);
            devices.push(device);
            channels.push(StreamChannel {
                channel,
                xports: BothXports {
                    recv: host.clone(),
                    send: host,
                    recv_buff_size: FRAME_SIZE * NUM_FRAMES,
                    send_buff_size: FRAME_SIZE * NUM_FRAMES,
                    send_sid: sid(channel).reversed(),
                    recv_sid: sid(channel),
                },
            });
        }
        let streamer = RxStreamer::new(setup(), channels, Arc::new(radio), alignment).await.unwrap();
        (devices, streamer)
    }

    async fn send(device: &MemoryZeroCopy, frame: Vec<u8>) {
        assert!(device.send_bytes(&frame, Duration::ZERO).await.unwrap());
    }

    #[test]
    fn test_buffer_count_must_match_channels() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (_devices, streamer) = streamer(2, radio(), AlignmentConfig::default()).await;
            let mut buf = vec![Sc16::default(); 8];
            let mut md = RxMetadata::default();

            let err = streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(10), false).await.unwrap_err();
            assert!(matches!(err.downcast_ref::<TransportError>(), Some(TransportError::InvalidArgument(_))));
        });
    }

    #[test]
    fn test_frame_without_room_for_samples() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (_device, host) = MemoryZeroCopy::pair(16, NUM_FRAMES);
            let host: Arc<dyn ZeroCopyTransport> = Arc::new(host);
            let channel = StreamChannel {
                channel: 0,
                xports: BothXports {
                    recv: host.clone(),
                    send: host,
                    recv_buff_size: 16 * NUM_FRAMES,
                    send_buff_size: 16 * NUM_FRAMES,
                    send_sid: sid(0).reversed(),
                    recv_sid: sid(0),
                },
            };

            let result = RxStreamer::<Sc16>::new(setup(), vec![channel], Arc::new(MockRadioCtrl::new()), AlignmentConfig::default()).await;
            assert!(matches!(result.err().unwrap().downcast_ref::<TransportError>(), Some(TransportError::InvalidArgument(_))));
        });
    }

    #[test]
    fn test_in_order_packets() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (devices, streamer) = streamer(1, radio(), AlignmentConfig::default()).await;
            for seq in 0..3u16 {
                send(&devices[0], data_packet(sid(0), seq, Some(1000 + 4 * seq as u64), &samps(4 * seq as i16, 4), false)).await;
            }

            let mut buf = vec![Sc16::default(); 12];
            let mut md = RxMetadata::default();
            assert_eq!(streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(100), false).await.unwrap(), 12);
            assert_eq!(buf, samps(0, 12));
            assert_eq!(md.error_code, RxErrorCode::None);
            assert!(md.has_time_spec);
            assert_eq!(md.time_spec, TimeSpec::new(10, 0.0));
            assert!(!md.more_fragments);
        });
    }

    #[test]
    fn test_fragments() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (devices, streamer) = streamer(1, radio(), AlignmentConfig::default()).await;
            send(&devices[0], data_packet(sid(0), 0, Some(200), &samps(0, 8), false)).await;

            let mut buf = vec![Sc16::default(); 5];
            let mut md = RxMetadata::default();
            assert_eq!(streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(100), false).await.unwrap(), 5);
            assert!(md.more_fragments);
            assert_eq!(md.fragment_offset, 0);
            assert_eq!(buf, samps(0, 5));

            assert_eq!(streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(100), true).await.unwrap(), 3);
            assert!(!md.more_fragments);
            assert_eq!(md.fragment_offset, 5);
            assert_eq!(md.time_spec, TimeSpec::new(2, 0.05));
            assert_eq!(&buf[..3], &samps(5, 3)[..]);
        });
    }

    #[test]
    fn test_single_gap_is_reported_once() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (devices, streamer) = streamer(1, radio(), AlignmentConfig::default()).await;
            for seq in [0u16, 1, 3, 4] {
                send(&devices[0], data_packet(sid(0), seq, None, &samps(seq as i16, 1), false)).await;
            }

            let mut buf = vec![Sc16::default(); 1];
            let mut md = RxMetadata::default();
            let mut results = Vec::new();
            for _ in 0..5 {
                let n = streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(100), true).await.unwrap();
                results.push((n, md.error_code, md.out_of_sequence, buf[0].re));
            }

            assert_eq!(results, vec![
                (1, RxErrorCode::None, false, 0),
                (1, RxErrorCode::None, false, 1),
                (0, RxErrorCode::Overflow, true, 1),
                (1, RxErrorCode::None, false, 3),
                (1, RxErrorCode::None, false, 4),
            ]);
        });
    }

    #[test]
    fn test_gap_after_samples_is_reported_next() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (devices, streamer) = streamer(1, radio(), AlignmentConfig::default()).await;
            send(&devices[0], data_packet(sid(0), 0, None, &samps(0, 2), false)).await;
            send(&devices[0], data_packet(sid(0), 2, None, &samps(10, 2), false)).await;

            let mut buf = vec![Sc16::default(); 8];
            let mut md = RxMetadata::default();
            assert_eq!(streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(100), false).await.unwrap(), 2);
            assert_eq!(md.error_code, RxErrorCode::None);

            assert_eq!(streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(100), false).await.unwrap(), 0);
            assert_eq!(md.error_code, RxErrorCode::Overflow);

            assert_eq!(streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(100), true).await.unwrap(), 2);
            assert_eq!(&buf[..2], &samps(10, 2)[..]);
        });
    }

    #[test]
    fn test_timeout() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (_devices, streamer) = streamer(1, radio(), AlignmentConfig::default()).await;
            let mut buf = vec![Sc16::default(); 8];
            let mut md = RxMetadata::default();

            let start = Instant::now();
            assert_eq!(streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(100), false).await.unwrap(), 0);
            assert_eq!(start.elapsed(), Duration::from_millis(100));
            assert_eq!(md.error_code, RxErrorCode::Timeout);
        });
    }

    #[rstest]
    #[case::late_command(2, RxErrorCode::LateCommand)]
    #[case::broken_chain(4, RxErrorCode::BrokenChain)]
    #[case::overflow(8, RxErrorCode::Overflow)]
    #[case::unknown(0x55, RxErrorCode::BadPacket)]
    fn test_inband_errors(#[case] code: u32, #[case] expected: RxErrorCode) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (devices, streamer) = streamer(1, radio(), AlignmentConfig::default()).await;
            send(&devices[0], error_packet(sid(0), code, Some(150))).await;
            send(&devices[0], data_packet(sid(0), 0, None, &samps(0, 2), false)).await;

            let mut buf = vec![Sc16::default(); 8];
            let mut md = RxMetadata::default();
            assert_eq!(streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(100), false).await.unwrap(), 0);
            assert_eq!(md.error_code, expected);
            assert!(!md.out_of_sequence);
            assert_eq!(md.time_spec, TimeSpec::new(1, 0.5));

            assert_eq!(streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(100), true).await.unwrap(), 2);
            assert_eq!(md.error_code, RxErrorCode::None);
        });
    }

    #[test]
    fn test_end_of_burst_ends_recv() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (devices, streamer) = streamer(1, radio(), AlignmentConfig::default()).await;
            send(&devices[0], data_packet(sid(0), 0, None, &samps(0, 2), false)).await;
            send(&devices[0], data_packet(sid(0), 1, None, &samps(2, 2), true)).await;
            send(&devices[0], data_packet(sid(0), 2, None, &samps(4, 2), false)).await;

            let mut buf = vec![Sc16::default(); 100];
            let mut md = RxMetadata::default();
            assert_eq!(streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(100), false).await.unwrap(), 4);
            assert!(md.end_of_burst);
        });
    }

    #[test]
    fn test_multi_channel_alignment() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (devices, streamer) = streamer(2, radio(), AlignmentConfig::default()).await;
            send(&devices[0], data_packet(sid(0), 0, Some(100), &samps(0, 4), false)).await;
            send(&devices[0], data_packet(sid(0), 1, Some(104), &samps(4, 4), false)).await;
            send(&devices[1], data_packet(sid(1), 0, Some(104), &samps(104, 4), false)).await;

            let mut buf0 = vec![Sc16::default(); 4];
            let mut buf1 = vec![Sc16::default(); 4];
            let mut md = RxMetadata::default();
            assert_eq!(streamer.recv(&mut [&mut buf0[..], &mut buf1[..]], &mut md, Duration::from_millis(100), false).await.unwrap(), 4);
            assert_eq!(md.error_code, RxErrorCode::None);
            assert_eq!(md.time_spec, TimeSpec::new(1, 0.04));
            assert_eq!(buf0, samps(4, 4));
            assert_eq!(buf1, samps(104, 4));
        });
    }

    #[test]
    fn test_alignment_gives_up() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let alignment = AlignmentConfig { tolerance_ticks: 0, max_attempts: 2 };
            let (devices, streamer) = streamer(2, radio(), alignment).await;
            send(&devices[0], data_packet(sid(0), 0, Some(100), &samps(0, 4), false)).await;
            send(&devices[0], data_packet(sid(0), 1, Some(200), &samps(0, 4), false)).await;
            send(&devices[1], data_packet(sid(1), 0, Some(150), &samps(0, 4), false)).await;
            send(&devices[1], data_packet(sid(1), 1, Some(250), &samps(0, 4), false)).await;

            let mut buf0 = vec![Sc16::default(); 4];
            let mut buf1 = vec![Sc16::default(); 4];
            let mut md = RxMetadata::default();
            assert_eq!(streamer.recv(&mut [&mut buf0[..], &mut buf1[..]], &mut md, Duration::from_millis(100), false).await.unwrap(), 0);
            assert_eq!(md.error_code, RxErrorCode::Alignment);
        });
    }

    #[test]
    fn test_multi_channel_start_is_timed() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut radio = radio();
            radio.expect_get_time_now().returning(|| Ok(TimeSpec::new(1, 0.0)));
            for channel in 0..2 {
                radio.expect_issue_stream_cmd()
                    .with(eq(channel), eq(StreamCmd::new(StreamMode::StartContinuous).at(TimeSpec::new(1, 0.05))))
                    .times(1)
                    .returning(|_, _| Ok(()));
            }

            let (_devices, streamer) = streamer(2, radio, AlignmentConfig::default()).await;
            streamer.issue_stream_cmd(&StreamCmd::new(StreamMode::StartContinuous)).await.unwrap();
        });
    }

    #[test]
    fn test_acks_flow_upstream() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (devices, streamer) = streamer(1, radio(), AlignmentConfig::default()).await;
            send(&devices[0], data_packet(sid(0), 0, None, &samps(0, 2), false)).await;

            let mut buf = vec![Sc16::default(); 2];
            let mut md = RxMetadata::default();
            assert_eq!(streamer.recv(&mut [&mut buf[..]], &mut md, Duration::from_millis(100), false).await.unwrap(), 2);

            // window of 16 packets at the default request frequency: an ACK for every packet
            let ack = devices[0].get_recv_buff(Duration::from_millis(10)).await.unwrap();
            let info = codec().unpack(ack.as_ref()).unwrap();
            assert_eq!(info.packet_type, PacketType::FlowControl);
            assert_eq!(info.sid, Some(sid(0).reversed()));
        });
    }
}
