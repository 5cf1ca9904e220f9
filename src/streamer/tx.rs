use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::async_msg::{AsyncMsgDrain, AsyncMsgQueue, AsyncMsgRouter, AsyncMsgSink};
use crate::convert::{Converter, CpuSample};
use crate::error::TransportError;
use crate::flow_control::tx::TxFlowControl;
use crate::metadata::{AsyncMetadata, TxMetadata};
use crate::packet::{HeaderCodec, HeaderFormat, IfPacketInfo};
use crate::radio::RadioCtrl;
use crate::sid::Sid;
use crate::streamer::{StreamChannel, StreamRates, StreamerHandle, StreamerSetup};
use crate::xport::{ManagedSendBuffer, ZeroCopyTransport};

const VRT_COUNT_MASK: u16 = 0xf;

enum TxSeq {
    /// CHDR: sending is throttled by the device's flow control responses
    FlowControlled(TxFlowControl),
    /// VRT: the 4 bit packet count of the next packet
    Unthrottled(u16),
}

impl TxSeq {
    async fn acquire(&mut self, xport: &dyn ZeroCopyTransport, timeout: Duration) -> anyhow::Result<Option<(ManagedSendBuffer, u16)>> {
        match self {
            TxSeq::FlowControlled(fc) => fc.get_tx_buff_with_flowctrl(xport, timeout).await,
            TxSeq::Unthrottled(next) => {
                let Some(buf) = xport.get_send_buff(timeout).await else {
                    return Ok(None);
                };
                let count = *next;
                *next = (count + 1) & VRT_COUNT_MASK;
                Ok(Some((buf, count)))
            }
        }
    }

    fn return_seq(&mut self) {
        match self {
            TxSeq::FlowControlled(fc) => fc.return_seq(),
            TxSeq::Unthrottled(next) => *next = next.wrapping_sub(1) & VRT_COUNT_MASK,
        }
    }
}

struct TxChannel {
    channel: usize,
    send: Arc<dyn ZeroCopyTransport>,
    send_sid: Sid,
    recv_sid: Sid,
    seq: TxSeq,
}

/// Header fields that differ between the packets of one `send()` call
#[derive(Copy, Clone, Debug, Default)]
struct PacketFlags {
    tsf: Option<u64>,
    sob: bool,
    eob: bool,
}

/// Sends samples of one or more channels.
///
/// Each call's samples are cut into packets of at most [TxStreamer::max_num_samps] samples per
///  channel. The metadata's time goes on the first packet, start-of-burst on the first and
///  end-of-burst on the last. The packets of all channels for one chunk are only written once a
///  buffer was acquired for every channel, so a timeout never leaves channels out of step.
///
/// The device's flow control responses and TX events come back on each channel's transport.
///  A drain task per channel forwards them to flow control and to the async message queue.
pub struct TxStreamer<S: CpuSample> {
    channels: tokio::sync::Mutex<Vec<TxChannel>>,
    channel_indices: Vec<usize>,
    recv_sids: Vec<Sid>,
    codec: HeaderCodec,
    converter: Converter,
    rates: Mutex<StreamRates>,
    max_samps_per_packet: usize,
    router: Arc<AsyncMsgRouter>,
    async_queue: Arc<AsyncMsgQueue>,
    _drains: Vec<AsyncMsgDrain>,
    _samples: PhantomData<fn() -> S>,
}

impl<S: CpuSample> TxStreamer<S> {
    pub async fn new(setup: StreamerSetup, channels: Vec<StreamChannel>, radio: Arc<dyn RadioCtrl>, sink: AsyncMsgSink,
                     tx_hw_buff_size: usize) -> anyhow::Result<TxStreamer<S>> {
        if channels.is_empty() {
            return Err(TransportError::InvalidArgument("a TX streamer needs at least one channel".to_string()).into());
        }
        if !setup.otw_format.is_tx_capable() {
            return Err(TransportError::InvalidArgument(format!("wire format {:?} can not be sent", setup.otw_format)).into());
        }

        let mut max_samps_per_packet = usize::MAX;
        for ch in &channels {
            let frame_size = ch.xports.send.send_frame_size();
            let samps = setup.otw_format.num_samps(frame_size.saturating_sub(setup.options.tx_max_len_hdr));
            if samps == 0 {
                return Err(TransportError::InvalidArgument(format!("TX frames of {} bytes leave no room for samples after a header of up to {} bytes", frame_size, setup.options.tx_max_len_hdr)).into());
            }
            max_samps_per_packet = max_samps_per_packet.min(samps);
        }

        let mut tx_channels: Vec<TxChannel> = Vec::with_capacity(channels.len());
        let mut drains = Vec::with_capacity(channels.len());
        for ch in channels {
            let seq = match setup.codec.format {
                HeaderFormat::Chdr => {
                    let window = tx_hw_buff_size / ch.xports.send.send_frame_size();
                    if let Err(e) = radio.setup_tx_flow_control(ch.channel, ch.xports.recv_sid, setup.options.tx_fc_response_freq).await {
                        for registered in &tx_channels {
                            sink.router.unregister(registered.recv_sid);
                        }
                        return Err(e);
                    }
                    let (fc, acks) = TxFlowControl::new(window, setup.options.tx_max_fc_stalls);
                    debug!("TX channel {} on {}: window of {} packets", ch.channel, ch.xports.send_sid, fc.window());
                    sink.router.register(ch.xports.recv_sid, ch.channel, Some(acks));
                    TxSeq::FlowControlled(fc)
                }
                HeaderFormat::Vrt => {
                    debug!("TX channel {} on {}", ch.channel, ch.xports.send_sid);
                    sink.router.register(ch.xports.recv_sid, ch.channel, None);
                    TxSeq::Unthrottled(0)
                }
            };
            drains.push(AsyncMsgDrain::spawn(ch.xports.recv.clone(), &sink));

            tx_channels.push(TxChannel {
                channel: ch.channel,
                send: ch.xports.send,
                send_sid: ch.xports.send_sid,
                recv_sid: ch.xports.recv_sid,
                seq,
            });
        }

        Ok(TxStreamer {
            channel_indices: tx_channels.iter().map(|c| c.channel).collect(),
            recv_sids: tx_channels.iter().map(|c| c.recv_sid).collect(),
            channels: tokio::sync::Mutex::new(tx_channels),
            codec: setup.codec,
            converter: Converter::new(setup.otw_format, setup.codec.endianness),
            rates: Mutex::new(setup.rates),
            max_samps_per_packet,
            router: sink.router,
            async_queue: sink.queue,
            _drains: drains,
            _samples: PhantomData,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.channel_indices.len()
    }

    /// the number of samples per channel that fit into one wire packet
    pub fn max_num_samps(&self) -> usize {
        self.max_samps_per_packet
    }

    /// Send the samples of one buffer per channel, up to the length of the shortest buffer.
    ///  Returns the number of samples per channel that were sent, which is less than requested
    ///  if buffers or flow control window did not become available within `timeout`.
    ///
    /// Sending no samples with end-of-burst set sends an empty packet that ends the burst.
    ///
    /// Fails if the number of buffers does not match the number of channels, if a packet can not
    ///  be handed to the transport, or once flow control stalled repeatedly. If some samples were
    ///  sent before such a failure, their number is returned instead, and the failure is logged.
    pub async fn send(&self, buffs: &[&[S]], metadata: &TxMetadata, timeout: Duration) -> anyhow::Result<usize> {
        if buffs.len() != self.channel_indices.len() {
            return Err(TransportError::InvalidArgument(format!("send() requires one buffer per channel: got {} buffers for {} channels", buffs.len(), self.channel_indices.len())).into());
        }

        let deadline = Instant::now() + timeout;
        let tick_rate = self.rates.lock().unwrap().tick_rate;
        let tsf = metadata.has_time_spec.then(|| metadata.time_spec.to_ticks(tick_rate));
        let nsamps = buffs.iter().map(|b| b.len()).min().unwrap_or(0);

        let mut channels = self.channels.lock().await;

        if nsamps == 0 {
            if metadata.end_of_burst {
                let flags = PacketFlags { tsf, sob: metadata.start_of_burst, eob: true };
                if !self.send_packet(&mut channels, buffs, 0, 0, flags, deadline).await? {
                    debug!("timeout sending end of burst");
                }
            }
            return Ok(0);
        }

        let mut sent = 0;
        while sent < nsamps {
            let n = (nsamps - sent).min(self.max_samps_per_packet);
            let flags = PacketFlags {
                tsf: if sent == 0 { tsf } else { None },
                sob: sent == 0 && metadata.start_of_burst,
                eob: sent + n == nsamps && metadata.end_of_burst,
            };
            match self.send_packet(&mut channels, buffs, sent, n, flags, deadline).await {
                Ok(true) => sent += n,
                Ok(false) => break,
                Err(e) if sent > 0 => {
                    warn!("sending stopped after {} of {} samples per channel: {:#}", sent, nsamps, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        trace!("sent {} of {} samples per channel", sent, nsamps);
        Ok(sent)
    }

    /// Send samples `offset..offset+n` of every channel as one packet per channel. Returns false
    ///  if nothing was sent because of a timeout.
    ///
    /// Packets are only committed once all of them were written. Sequence numbers of packets
    ///  that were not committed are handed back, so a failure does not leave a gap on the wire.
    async fn send_packet(&self, channels: &mut [TxChannel], buffs: &[&[S]], offset: usize, n: usize, flags: PacketFlags, deadline: Instant) -> anyhow::Result<bool> {
        let mut acquired = Vec::with_capacity(channels.len());
        let mut failure = None;
        for ch in channels.iter_mut() {
            match ch.seq.acquire(ch.send.as_ref(), deadline.saturating_duration_since(Instant::now())).await {
                Ok(Some(buf_and_seq)) => acquired.push(buf_and_seq),
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if acquired.len() < channels.len() {
            let num_acquired = acquired.len();
            drop(acquired);
            Self::return_seqs(&mut channels[..num_acquired]);
            return match failure {
                Some(e) => Err(e),
                None => {
                    trace!("timeout acquiring send buffers: {} of {} channels ready", num_acquired, channels.len());
                    Ok(false)
                }
            };
        }

        let mut packets = Vec::with_capacity(channels.len());
        for (i, (mut buf, seq)) in acquired.into_iter().enumerate() {
            if let Err(e) = self.write_packet(&channels[i], &mut buf, seq, &buffs[i][offset..offset + n], flags) {
                let channel = channels[i].channel;
                Self::return_seqs(channels);
                return Err(e.context(format!("writing packet for TX channel {}", channel)));
            }
            packets.push(buf);
        }

        for (i, mut buf) in packets.into_iter().enumerate() {
            let len = buf.buf_mut().len();
            if let Err(e) = buf.commit(len).await {
                let channel = channels[i].channel;
                Self::return_seqs(&mut channels[i..]);
                return Err(e.context(format!("sending packet for TX channel {}", channel)));
            }
        }
        Ok(true)
    }

    fn return_seqs(channels: &mut [TxChannel]) {
        for ch in channels {
            ch.seq.return_seq();
        }
    }

    fn write_packet(&self, ch: &TxChannel, buf: &mut ManagedSendBuffer, seq: u16, samps: &[S], flags: PacketFlags) -> anyhow::Result<()> {
        let mut info = IfPacketInfo::data(ch.send_sid);
        info.packet_count = seq;
        info.tsf = flags.tsf;
        info.sob = flags.sob;
        info.eob = flags.eob;
        info.num_payload_bytes = self.converter.otw.num_bytes(samps.len());

        self.codec.pack(&mut info, buf.buf_mut())?;
        self.converter.pack(samps, buf.buf_mut())?;
        Ok(())
    }

    /// Wait up to `timeout` for the next async device event, see [AsyncMsgQueue::pop]
    pub async fn recv_async_msg(&self, timeout: Duration) -> Option<AsyncMetadata> {
        self.async_queue.pop(timeout).await
    }
}

impl<S: CpuSample> StreamerHandle for TxStreamer<S> {
    fn channels(&self) -> Vec<usize> {
        self.channel_indices.clone()
    }

    fn set_tick_rate(&self, tick_rate: f64) {
        self.rates.lock().unwrap().tick_rate = tick_rate;
    }

    fn set_samp_rate(&self, samp_rate: f64) {
        self.rates.lock().unwrap().samp_rate = samp_rate;
    }
}

impl<S: CpuSample> Drop for TxStreamer<S> {
    fn drop(&mut self) {
        for &sid in &self.recv_sids {
            self.router.unregister(sid);
        }
    }
}
