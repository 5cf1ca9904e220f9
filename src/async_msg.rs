//! Asynchronous device messages.
//!
//! The device reports TX stream events (burst ACKs, underflows, sequence and time errors) and
//!  TX flow control responses on the session's async message transport and on the return path
//!  of each TX stream's transport. An [AsyncMsgDrain] task continuously receives from one such
//!  transport: flow control responses go to the owning TX stream's flow control, everything else
//!  is decoded into [AsyncMetadata] and pushed into an [AsyncMsgQueue] for the application to
//!  pick up.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use crate::flow_control::rx::decode_fc_payload;
use crate::flow_control::tx::TxAckSender;
use crate::metadata::{AsyncMetadata, EventCode};
use crate::packet::{HeaderCodec, PacketType};
use crate::sid::Sid;
use crate::time_spec::TimeSpec;
use crate::util::buf_ext::BufExt;
use crate::xport::ZeroCopyTransport;

/// A bounded queue of async messages. When it is full, pushing drops the oldest message: the
///  drain task must never block on a slow consumer, and recent events are the relevant ones.
pub struct AsyncMsgQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

struct QueueState {
    messages: VecDeque<AsyncMetadata>,
    num_dropped: u64,
}

impl AsyncMsgQueue {
    pub fn new(capacity: usize) -> AsyncMsgQueue {
        let capacity = capacity.max(1);
        AsyncMsgQueue {
            state: Mutex::new(QueueState {
                messages: VecDeque::with_capacity(capacity),
                num_dropped: 0,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    pub fn push(&self, msg: AsyncMetadata) {
        {
            let mut state = self.state.lock().unwrap();
            if state.messages.len() >= self.capacity {
                if let Some(dropped) = state.messages.pop_front() {
                    debug!("async message queue is full - dropping oldest message {:?}", dropped.event_code);
                }
                state.num_dropped += 1;
            }
            state.messages.push_back(msg);
        }
        self.notify.notify_one();
    }

    /// Wait up to `timeout` for a message. Returns `None` on timeout.
    pub async fn pop(&self, timeout: Duration) -> Option<AsyncMetadata> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.state.lock().unwrap().messages.pop_front() {
                return Some(msg);
            }
            // a notification from a push between the check and here is stored as a permit
            if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// number of messages dropped because the queue was full
    pub fn num_dropped(&self) -> u64 {
        self.state.lock().unwrap().num_dropped
    }
}

struct TxRoute {
    channel: usize,
    /// `None` for streams without flow control responses
    acks: Option<TxAckSender>,
}

/// TX streams that the drain task delivers to, keyed by the SID the device uses for their
///  async messages and flow control responses
#[derive(Default)]
pub struct AsyncMsgRouter {
    routes: Mutex<FxHashMap<Sid, TxRoute>>,
}

impl AsyncMsgRouter {
    pub fn register(&self, recv_sid: Sid, channel: usize, acks: Option<TxAckSender>) {
        debug!("routing async messages for {} to TX channel {}", recv_sid, channel);
        self.routes.lock().unwrap().insert(recv_sid, TxRoute { channel, acks });
    }

    pub fn unregister(&self, recv_sid: Sid) {
        if self.routes.lock().unwrap().remove(&recv_sid).is_some() {
            debug!("removed async message route for {}", recv_sid);
        }
    }

    fn channel(&self, recv_sid: Sid) -> Option<usize> {
        self.routes.lock().unwrap().get(&recv_sid).map(|r| r.channel)
    }

    /// deliver a flow control response, returning false if no flow controlled stream has this SID
    pub(crate) fn ack(&self, recv_sid: Sid, seq: u32) -> bool {
        match self.routes.lock().unwrap().get(&recv_sid).and_then(|r| r.acks.as_ref()) {
            Some(acks) => {
                acks.ack(seq);
                true
            }
            None => false,
        }
    }
}

/// Where drained messages go, shared by all drain tasks of a session
#[derive(Clone)]
pub struct AsyncMsgSink {
    pub codec: HeaderCodec,
    /// for converting event timestamps
    pub tick_rate: watch::Receiver<f64>,
    pub queue: Arc<AsyncMsgQueue>,
    pub router: Arc<AsyncMsgRouter>,
    pub poll_interval: Duration,
}

/// Handle to the background task draining the async message transport. Dropping it stops the
///  task.
pub struct AsyncMsgDrain {
    cancel: CancellationToken,
}

impl AsyncMsgDrain {
    pub fn spawn(xport: Arc<dyn ZeroCopyTransport>, sink: &AsyncMsgSink) -> AsyncMsgDrain {
        let cancel = CancellationToken::new();
        let handler = AsyncMsgHandler {
            codec: sink.codec,
            tick_rate: sink.tick_rate.clone(),
            queue: sink.queue.clone(),
            router: sink.router.clone(),
        };
        tokio::spawn(Self::drain_loop(xport, handler, sink.poll_interval, cancel.clone()));
        AsyncMsgDrain { cancel }
    }

    async fn drain_loop(xport: Arc<dyn ZeroCopyTransport>, handler: AsyncMsgHandler, poll_interval: Duration, cancel: CancellationToken) {
        debug!("starting async message drain task");
        loop {
            let poll_end = Instant::now() + poll_interval;
            let buf = tokio::select! {
                _ = cancel.cancelled() => break,
                buf = xport.get_recv_buff(poll_interval) => buf,
            };
            match buf {
                Some(buf) => handler.handle_packet(buf.as_ref()),
                // a closed transport returns at once: poll it no more than once per interval
                None => tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(poll_end) => {}
                },
            }
        }
        debug!("async message drain task stopped");
    }
}

impl Drop for AsyncMsgDrain {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct AsyncMsgHandler {
    codec: HeaderCodec,
    tick_rate: watch::Receiver<f64>,
    queue: Arc<AsyncMsgQueue>,
    router: Arc<AsyncMsgRouter>,
}

impl AsyncMsgHandler {
    fn handle_packet(&self, frame: &[u8]) {
        let info = match self.codec.unpack(frame) {
            Ok(info) => info,
            Err(e) => {
                warn!("dropping malformed async message: {}", e);
                return;
            }
        };
        let Some(sid) = info.sid else {
            warn!("dropping async message without a SID");
            return;
        };
        let payload = &frame[info.header_len_bytes()..info.header_len_bytes() + info.num_payload_bytes];

        if info.packet_type == PacketType::FlowControl {
            match decode_fc_payload(payload, self.codec) {
                Ok(seq) => {
                    trace!("TX flow control response for {}: sequence {}", sid, seq);
                    if !self.router.ack(sid, seq) {
                        debug!("flow control response for unknown stream {}", sid);
                    }
                }
                Err(e) => warn!("dropping malformed flow control response for {}: {}", sid, e),
            }
            return;
        }

        let Some(channel) = self.router.channel(sid) else {
            warn!("dropping async message for unknown stream {}", sid);
            return;
        };

        match self.decode_event(channel, payload, info.tsf) {
            Ok(msg) => {
                if let Some(marker) = msg.event_code.marker() {
                    debug!("{}", marker);
                }
                trace!("async message on channel {}: {:?}", channel, msg.event_code);
                self.queue.push(msg);
            }
            Err(e) => warn!("dropping malformed async message for {}: {}", sid, e),
        }
    }

    /// payload: the event code in the lowest byte of the first word, then up to four words of
    ///  user payload
    fn decode_event(&self, channel: usize, payload: &[u8], tsf: Option<u64>) -> anyhow::Result<AsyncMetadata> {
        let mut payload = payload;
        let code = payload.try_get_word32(self.codec.endianness)?;

        let mut msg = AsyncMetadata::new(channel, EventCode::from((code & 0xff) as u8));
        for word in msg.user_payload.iter_mut() {
            match payload.try_get_word32(self.codec.endianness) {
                Ok(w) => *word = w,
                Err(_) => break,
            }
        }
        if let Some(tsf) = tsf {
            msg.has_time_spec = true;
            msg.time_spec = TimeSpec::from_ticks(tsf, *self.tick_rate.borrow());
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::flow_control::tx::TxFlowControl;
    use crate::packet::{Endianness, IfPacketInfo};
    use crate::util::buf_ext::BufMutExt;
    use crate::xport::{ManagedRecvBuffer, ManagedSendBuffer};
    use crate::xport::memory::MemoryZeroCopy;

    const TX_RECV_SID: Sid = Sid::from_raw(0x0030_0002);

    fn codec() -> HeaderCodec {
        HeaderCodec::chdr(Endianness::Little)
    }

    fn event(code: u8) -> AsyncMetadata {
        AsyncMetadata::new(0, EventCode::from(code))
    }

    fn packet(packet_type: PacketType, sid: Sid, tsf: Option<u64>, words: &[u32]) -> Vec<u8> {
        let mut info = IfPacketInfo::new(packet_type, sid);
        info.tsf = tsf;
        info.num_payload_bytes = words.len() * 4;
        let mut frame = Vec::new();
        codec().pack(&mut info, &mut frame).unwrap();
        for w in words {
            frame.put_word32(*w, Endianness::Little);
        }
        frame
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let queue = AsyncMsgQueue::new(2);
            queue.push(event(0x01));
            queue.push(event(0x02));
            queue.push(event(0x04));

            assert_eq!(queue.len(), 2);
            assert_eq!(queue.num_dropped(), 1);
            assert_eq!(queue.pop(Duration::ZERO).await.unwrap().event_code, EventCode::Underflow);
            assert_eq!(queue.pop(Duration::ZERO).await.unwrap().event_code, EventCode::SeqError);
            assert!(queue.pop(Duration::ZERO).await.is_none());
        });
    }

    #[rstest]
    #[case::zero(0)]
    #[case::short(10)]
    #[case::long(1000)]
    fn test_pop_times_out(#[case] millis: u64) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let queue = AsyncMsgQueue::new(4);
            let start = Instant::now();
            assert!(queue.pop(Duration::from_millis(millis)).await.is_none());
            assert_eq!(start.elapsed(), Duration::from_millis(millis));
        });
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let queue = Arc::new(AsyncMsgQueue::new(4));
            let q = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                q.push(event(0x08));
            });

            let start = Instant::now();
            assert_eq!(queue.pop(Duration::from_secs(1)).await.unwrap().event_code, EventCode::TimeError);
            assert_eq!(start.elapsed(), Duration::from_millis(20));
        });
    }

    struct Setup {
        device: MemoryZeroCopy,
        queue: Arc<AsyncMsgQueue>,
        router: Arc<AsyncMsgRouter>,
        _drain: AsyncMsgDrain,
        tick_rate: watch::Sender<f64>,
    }

    fn setup() -> Setup {
        let (device, host) = MemoryZeroCopy::pair(256, 16);
        let (tick_tx, tick_rx) = watch::channel(100e6);
        let queue = Arc::new(AsyncMsgQueue::new(8));
        let router = Arc::new(AsyncMsgRouter::default());
        let sink = AsyncMsgSink {
            codec: codec(),
            tick_rate: tick_rx,
            queue: queue.clone(),
            router: router.clone(),
            poll_interval: Duration::from_millis(100),
        };
        let drain = AsyncMsgDrain::spawn(Arc::new(host), &sink);
        Setup { device, queue, router, _drain: drain, tick_rate: tick_tx }
    }

    #[test]
    fn test_drain_decodes_events() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let s = setup();
            let (_fc, acks) = TxFlowControl::new(4, 8);
            s.router.register(TX_RECV_SID, 3, Some(acks));

            s.device.send_bytes(&packet(PacketType::Data, TX_RECV_SID, Some(250_000_000), &[0x0000_0102]), Duration::ZERO).await.unwrap();
            s.device.send_bytes(&packet(PacketType::Data, TX_RECV_SID, None, &[0x40, 1, 2, 3, 4]), Duration::ZERO).await.unwrap();
            s.device.send_bytes(&packet(PacketType::Data, Sid::from_raw(0x0099_0001), None, &[0x02]), Duration::ZERO).await.unwrap();

            let underflow = s.queue.pop(Duration::from_millis(100)).await.unwrap();
            assert_eq!(underflow.channel, 3);
            assert_eq!(underflow.event_code, EventCode::Underflow);
            assert!(underflow.has_time_spec);
            assert_eq!(underflow.time_spec, TimeSpec::new(2, 0.5));

            let user = s.queue.pop(Duration::from_millis(100)).await.unwrap();
            assert_eq!(user.event_code, EventCode::UserPayload);
            assert_eq!(user.user_payload, [1, 2, 3, 4]);
            assert!(!user.has_time_spec);

            // unknown stream
            assert!(s.queue.pop(Duration::from_millis(100)).await.is_none());
        });
    }

    #[test]
    fn test_drain_routes_flow_control() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let s = setup();
            let (tx_device, tx_host) = MemoryZeroCopy::pair(256, 16);
            let (mut fc, acks) = TxFlowControl::new(2, 8);
            s.router.register(TX_RECV_SID, 0, Some(acks));

            for _ in 0..2 {
                let (buf, _) = fc.get_tx_buff_with_flowctrl(&tx_host, Duration::ZERO).await.unwrap().unwrap();
                buf.commit(0).await.unwrap();
            }
            assert!(fc.get_tx_buff_with_flowctrl(&tx_host, Duration::from_millis(10)).await.unwrap().is_none());

            s.device.send_bytes(&packet(PacketType::FlowControl, TX_RECV_SID, None, &[0, 1]), Duration::ZERO).await.unwrap();
            let (_buf, seq) = fc.get_tx_buff_with_flowctrl(&tx_host, Duration::from_millis(100)).await.unwrap().unwrap();
            assert_eq!(seq, 2);
            assert_eq!(fc.in_flight(), 1);
            assert!(s.queue.is_empty());
            drop(tx_device);
        });
    }

    /// a transport whose peer is gone: every receive returns at once
    #[derive(Default)]
    struct ClosedXport {
        num_polls: AtomicUsize,
    }

    #[async_trait]
    impl ZeroCopyTransport for ClosedXport {
        async fn get_recv_buff(&self, _timeout: Duration) -> Option<ManagedRecvBuffer> {
            self.num_polls.fetch_add(1, Ordering::SeqCst);
            None
        }

        async fn get_send_buff(&self, _timeout: Duration) -> Option<ManagedSendBuffer> {
            None
        }

        fn num_recv_frames(&self) -> usize {
            1
        }

        fn recv_frame_size(&self) -> usize {
            64
        }

        fn num_send_frames(&self) -> usize {
            1
        }

        fn send_frame_size(&self) -> usize {
            64
        }
    }

    #[test]
    fn test_drain_polls_closed_transport_once_per_interval() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let s = setup();
            let xport = Arc::new(ClosedXport::default());
            let sink = AsyncMsgSink {
                codec: codec(),
                tick_rate: s.tick_rate.subscribe(),
                queue: s.queue.clone(),
                router: s.router.clone(),
                poll_interval: Duration::from_millis(100),
            };
            let drain = AsyncMsgDrain::spawn(xport.clone(), &sink);

            tokio::time::sleep(Duration::from_millis(1050)).await;
            assert_eq!(xport.num_polls.load(Ordering::SeqCst), 11);

            drop(drain);
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert_eq!(xport.num_polls.load(Ordering::SeqCst), 11);
        });
    }
}
