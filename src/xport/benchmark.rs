use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use crate::packet::{Endianness, HeaderCodec, IfPacketInfo};
use crate::packet::chdr;
use crate::sid::Sid;
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::xport::ZeroCopyTransport;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BenchmarkResults {
    pub duration: Duration,
    pub num_tx_packets: u64,
    pub num_rx_packets: u64,
    pub num_tx_timeouts: u64,
    pub num_rx_timeouts: u64,
    pub num_data_errors: u64,
    pub tx_bytes_per_sec: f64,
    pub rx_bytes_per_sec: f64,
}

const TX_TIMEOUT: Duration = Duration::from_millis(250);
const RX_TIMEOUT: Duration = Duration::from_millis(250);

fn payload_word(index: usize) -> u32 {
    0xACE0_0000 | (index as u32 & 0xffff)
}

/// Stream full-size CHDR data packets with a recognizable payload on `tx` for `duration` while
///  receiving and verifying them on `rx`. `rx` must see what `tx` sends, e.g. through a device
///  looping back the stream.
pub async fn benchmark_throughput_chdr(tx: Arc<dyn ZeroCopyTransport>, rx: Arc<dyn ZeroCopyTransport>, sid: Sid,
                                       endianness: Endianness, duration: Duration) -> anyhow::Result<BenchmarkResults> {
    let codec = HeaderCodec::chdr(endianness);
    let payload_bytes = (tx.send_frame_size().min(rx.recv_frame_size()) - 8) / 4 * 4;
    info!("benchmarking {} for {:?} with {} payload bytes per packet", sid, duration, payload_bytes);

    let cancel = CancellationToken::new();
    let tx_task = tokio::spawn(stream_tx(tx, codec, sid, payload_bytes, cancel.clone()));
    let rx_task = tokio::spawn(stream_rx(rx, codec, sid, payload_bytes, cancel.clone()));

    let start = Instant::now();
    tokio::time::sleep(duration).await;
    cancel.cancel();

    let (num_tx_packets, num_tx_timeouts) = tx_task.await??;
    let (num_rx_packets, num_rx_timeouts, num_data_errors) = rx_task.await?;
    let elapsed = start.elapsed();

    let packet_bytes = (payload_bytes + 8) as f64;
    let secs = elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
    let results = BenchmarkResults {
        duration: elapsed,
        num_tx_packets,
        num_rx_packets,
        num_tx_timeouts,
        num_rx_timeouts,
        num_data_errors,
        tx_bytes_per_sec: num_tx_packets as f64 * packet_bytes / secs,
        rx_bytes_per_sec: num_rx_packets as f64 * packet_bytes / secs,
    };
    info!("benchmark results: {:?}", results);
    Ok(results)
}

async fn stream_tx(xport: Arc<dyn ZeroCopyTransport>, codec: HeaderCodec, sid: Sid, payload_bytes: usize, cancel: CancellationToken) -> anyhow::Result<(u64, u64)> {
    let mut num_packets = 0u64;
    let mut num_timeouts = 0u64;
    let mut seq = 0u16;

    while !cancel.is_cancelled() {
        let Some(mut buf) = xport.get_send_buff(TX_TIMEOUT).await else {
            num_timeouts += 1;
            continue;
        };

        let mut info = IfPacketInfo::data(sid);
        info.packet_count = seq;
        info.num_payload_bytes = payload_bytes;

        let frame = buf.buf_mut();
        let header_len = codec.pack(&mut info, frame)?;
        for i in 0..payload_bytes / 4 {
            frame.put_word32(payload_word(i), codec.endianness);
        }
        if let Err(e) = buf.commit(header_len + payload_bytes).await {
            // the receiving end may be torn down first
            if cancel.is_cancelled() {
                break;
            }
            return Err(e);
        }

        num_packets += 1;
        seq = (seq + 1) & chdr::SEQ_MASK;
        tokio::task::yield_now().await;
    }
    debug!("benchmark TX stopped after {} packets", num_packets);
    Ok((num_packets, num_timeouts))
}

async fn stream_rx(xport: Arc<dyn ZeroCopyTransport>, codec: HeaderCodec, sid: Sid, payload_bytes: usize, cancel: CancellationToken) -> (u64, u64, u64) {
    let mut num_packets = 0u64;
    let mut num_timeouts = 0u64;
    let mut num_errors = 0u64;

    loop {
        let buf = tokio::select! {
            _ = cancel.cancelled() => break,
            buf = xport.get_recv_buff(RX_TIMEOUT) => buf,
        };
        let Some(buf) = buf else {
            num_timeouts += 1;
            continue;
        };

        num_packets += 1;
        if !is_expected_packet(buf.as_ref(), codec, sid, payload_bytes) {
            num_errors += 1;
        }
    }
    debug!("benchmark RX stopped after {} packets", num_packets);
    (num_packets, num_timeouts, num_errors)
}

fn is_expected_packet(frame: &[u8], codec: HeaderCodec, sid: Sid, payload_bytes: usize) -> bool {
    let Ok(info) = codec.unpack(frame) else {
        return false;
    };
    if info.sid != Some(sid) || info.num_payload_bytes != payload_bytes {
        return false;
    }

    let mut payload = &frame[info.header_len_bytes()..];
    (0..payload_bytes / 4).all(|i| payload.try_get_word32(codec.endianness).ok() == Some(payload_word(i)))
}
