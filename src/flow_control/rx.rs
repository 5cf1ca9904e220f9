use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use crate::flow_control::unwrap_seq_after;
use crate::packet::{HeaderCodec, IfPacketInfo, PacketType};
use crate::packet::chdr::SEQ_MASK;
use crate::sid::Sid;
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::xport::ZeroCopyTransport;

/// Result of checking an incoming packet's sequence number
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeqCheck {
    /// the first packet of the stream - there is nothing to compare to
    First,
    InSequence,
    /// packets were lost between the previously received packet and this one
    Gap { expected: u16, actual: u16 },
}

/// Progress of a stream as reported upstream: the number of packets consumed and the unwrapped
///  sequence number of the last one
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct Consumed {
    num_packets: u64,
    last_seq: u32,
}

/// RX side flow control of one stream.
///
/// The receive path calls [RxFlowControl::on_packet] for every packet; a gap in the sequence
///  numbers is reported to the caller, and tracking continues from the observed sequence number
///  so that a single loss is reported once. Lost packets are never waited for.
///
/// Every `ack_interval` consumed packets, a background task sends a flow control packet with the
///  last consumed sequence number to the device. That task is decoupled from the receive path
///  so the device's window keeps advancing while the application is busy with the data.
pub struct RxFlowControl {
    last_seq_in: Option<u32>,
    num_consumed: u64,
    consumed: watch::Sender<Consumed>,
    cancel: CancellationToken,
}

impl RxFlowControl {
    const FC_SEND_TIMEOUT: Duration = Duration::from_millis(100);
    const FC_PAYLOAD_BYTES: usize = 8;

    /// number of packets per flow control ACK for a window of `window_packets`
    pub fn ack_interval(window_packets: usize, rx_fc_request_freq: usize) -> usize {
        (window_packets / rx_fc_request_freq.max(1)).max(1)
    }

    /// Start flow control for a stream received with `recv_sid`. ACKs are sent on `xport` with
    ///  the reversed SID.
    pub fn new(xport: Arc<dyn ZeroCopyTransport>, codec: HeaderCodec, recv_sid: Sid, ack_interval: usize) -> RxFlowControl {
        let (consumed_tx, consumed_rx) = watch::channel(Consumed::default());
        let cancel = CancellationToken::new();

        tokio::spawn(Self::ack_loop(xport, codec, recv_sid.reversed(), ack_interval.max(1) as u64, consumed_rx, cancel.clone()));

        RxFlowControl {
            last_seq_in: None,
            num_consumed: 0,
            consumed: consumed_tx,
            cancel,
        }
    }

    /// Continue from a known sequence number, e.g. after a stream was re-established
    pub fn set_last_seq_in(&mut self, seq: u16) {
        self.last_seq_in = Some((seq & SEQ_MASK) as u32);
    }

    /// the 12 bit sequence number of the last packet received
    pub fn last_seq_in(&self) -> Option<u16> {
        self.last_seq_in.map(|s| (s as u16) & SEQ_MASK)
    }

    /// Check an incoming packet's sequence number and account for it as consumed
    pub fn on_packet(&mut self, seq: u16) -> SeqCheck {
        let seq = seq & SEQ_MASK;
        let (check, seq32) = match self.last_seq_in {
            None => (SeqCheck::First, seq as u32),
            Some(last) => {
                let next = last.wrapping_add(1);
                let expected = ((next as u16) & SEQ_MASK, next);
                let seq32 = unwrap_seq_after(next, seq);
                if seq32 == expected.1 {
                    (SeqCheck::InSequence, seq32)
                }
                else {
                    debug!("D: sequence gap, expected {} but got {}", expected.0, seq);
                    (SeqCheck::Gap { expected: expected.0, actual: seq }, seq32)
                }
            }
        };

        self.last_seq_in = Some(seq32);
        self.num_consumed += 1;
        let consumed = Consumed { num_packets: self.num_consumed, last_seq: seq32 };
        self.consumed.send_replace(consumed);
        check
    }

    async fn ack_loop(xport: Arc<dyn ZeroCopyTransport>, codec: HeaderCodec, send_sid: Sid, ack_interval: u64,
                      mut consumed: watch::Receiver<Consumed>, cancel: CancellationToken) {
        debug!("starting RX flow control for {}, ACK every {} packets", send_sid.reversed(), ack_interval);
        let mut num_acked = 0u64;
        let mut fc_seq = 0u16;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = consumed.changed() => if changed.is_err() {
                    break;
                }
            }

            let current = *consumed.borrow_and_update();
            if current.num_packets - num_acked < ack_interval {
                continue;
            }

            match Self::send_ack(xport.as_ref(), codec, send_sid, fc_seq, current.last_seq).await {
                Ok(true) => {
                    trace!("sent flow control ACK for sequence {} on {}", current.last_seq, send_sid);
                    num_acked = current.num_packets;
                    fc_seq = (fc_seq + 1) & SEQ_MASK;
                }
                Ok(false) => warn!("no send buffer for flow control ACK on {} - retrying with the next packet", send_sid),
                Err(e) => warn!("error sending flow control ACK on {}: {}", send_sid, e),
            }
        }
        debug!("RX flow control for {} stopped", send_sid.reversed());
    }

    async fn send_ack(xport: &dyn ZeroCopyTransport, codec: HeaderCodec, send_sid: Sid, fc_seq: u16, last_seq: u32) -> anyhow::Result<bool> {
        let Some(mut buf) = xport.get_send_buff(Self::FC_SEND_TIMEOUT).await else {
            return Ok(false);
        };

        let mut info = IfPacketInfo::new(PacketType::FlowControl, send_sid);
        info.packet_count = fc_seq;
        info.num_payload_bytes = Self::FC_PAYLOAD_BYTES;

        let frame = buf.buf_mut();
        let header_len = codec.pack(&mut info, frame)?;
        frame.put_word32(0, codec.endianness);
        frame.put_word32(last_seq, codec.endianness);

        buf.commit(header_len + Self::FC_PAYLOAD_BYTES).await?;
        Ok(true)
    }
}

impl Drop for RxFlowControl {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Decode the payload of a flow control packet: the unwrapped sequence number it acknowledges
pub fn decode_fc_payload(payload: &[u8], codec: HeaderCodec) -> anyhow::Result<u32> {
    let mut payload = payload;
    let _reserved = payload.try_get_word32(codec.endianness)?;
    payload.try_get_word32(codec.endianness)
}
