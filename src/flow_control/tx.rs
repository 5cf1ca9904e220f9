use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, trace};
use crate::error::TransportError;
use crate::flow_control::unwrap_seq_before;
use crate::packet::chdr::SEQ_MASK;
use crate::safe_converter::PrecheckedCast;
use crate::xport::{ManagedSendBuffer, ZeroCopyTransport};

/// Delivers the device's TX acknowledgements to a [TxFlowControl]. Cloned into the async message
///  handling that decodes flow control responses.
///
/// Acks are cumulative, so only the latest one matters: a newer ack replaces one that was not
///  consumed yet.
#[derive(Clone)]
pub struct TxAckSender {
    tx: watch::Sender<Option<u32>>,
}

impl TxAckSender {
    /// the device consumed every packet up to and including sequence number `seq`
    pub fn ack(&self, seq: u32) {
        self.tx.send_replace(Some(seq));
    }
}

/// TX side flow control of one stream: at most `window` packets may be in flight, i.e. sent but
///  not yet acknowledged by the device as consumed.
pub struct TxFlowControl {
    window: u32,
    /// number of packets sent so far, i.e. the unwrapped sequence number of the next packet
    num_sent: u32,
    /// number of packets the device acknowledged as consumed
    num_acked: u32,
    acks: watch::Receiver<Option<u32>>,
    /// window timeouts since the last ACK that freed space
    num_stalls: u32,
    max_stalls: u32,
}

impl TxFlowControl {
    /// `window` is the device's buffer capacity in packets. It must be less than the 12 bit
    ///  sequence number range.
    ///
    /// After `max_stalls` timeouts waiting for window space without any ACK in between, the
    ///  device is considered gone and acquiring fails with [TransportError::FlowControlStalled].
    pub fn new(window: usize, max_stalls: usize) -> (TxFlowControl, TxAckSender) {
        let window: u32 = window.clamp(1, SEQ_MASK as usize).prechecked_cast();
        let max_stalls: u32 = max_stalls.clamp(1, u32::MAX as usize).prechecked_cast();
        let (tx, rx) = watch::channel(None);

        (TxFlowControl {
            window,
            num_sent: 0,
            num_acked: 0,
            acks: rx,
            num_stalls: 0,
            max_stalls,
        }, TxAckSender { tx })
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn in_flight(&self) -> u32 {
        self.num_sent.wrapping_sub(self.num_acked)
    }

    /// the 12 bit sequence number the next packet will carry
    pub fn next_seq(&self) -> u16 {
        (self.num_sent as u16) & SEQ_MASK
    }

    /// Wait for window space, then for a send buffer. On success, the buffer is returned with
    ///  the sequence number that its packet must carry. That sequence number is consumed even if
    ///  the buffer is dropped without committing, unless it is handed back with
    ///  [TxFlowControl::return_seq].
    ///
    /// Returns `None` if either does not become available before `timeout`, and an error once
    ///  the window stalled too often in a row.
    pub async fn get_tx_buff_with_flowctrl(&mut self, xport: &dyn ZeroCopyTransport, timeout: Duration) -> anyhow::Result<Option<(ManagedSendBuffer, u16)>> {
        let deadline = Instant::now() + timeout;

        loop {
            self.apply_latest_ack();
            if self.in_flight() < self.window {
                break;
            }

            trace!("TX window full ({} in flight), waiting for ACK", self.in_flight());
            match tokio::time::timeout_at(deadline, self.acks.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    // no more acks can arrive
                    tokio::time::sleep_until(deadline).await;
                    return self.on_stall();
                }
                Err(_) => return self.on_stall(),
            }
        }

        let Some(buf) = xport.get_send_buff(deadline.saturating_duration_since(Instant::now())).await else {
            return Ok(None);
        };
        let seq = self.next_seq();
        self.num_sent = self.num_sent.wrapping_add(1);
        Ok(Some((buf, seq)))
    }

    fn on_stall(&mut self) -> anyhow::Result<Option<(ManagedSendBuffer, u16)>> {
        self.num_stalls = self.num_stalls.saturating_add(1);
        debug!("timeout waiting for TX flow control window: {} packets in flight, stall #{}", self.in_flight(), self.num_stalls);
        if self.num_stalls >= self.max_stalls {
            error!("TX flow control stalled: no ACK after {} timeouts", self.num_stalls);
            return Err(TransportError::FlowControlStalled {
                in_flight: self.in_flight(),
                stalls: self.num_stalls,
            }.into());
        }
        Ok(None)
    }

    /// Hand back the sequence number of the most recently acquired buffer, which was dropped
    ///  without being committed. Must not be called after acquiring another buffer.
    pub fn return_seq(&mut self) {
        if self.in_flight() > 0 {
            self.num_sent = self.num_sent.wrapping_sub(1);
        }
    }

    /// Apply the most recent ack, ignoring it if it does not advance the acknowledged count.
    ///  Devices may coalesce acks, so an ack need not be for the next expected packet.
    fn apply_latest_ack(&mut self) {
        let Some(seq) = *self.acks.borrow_and_update() else {
            return;
        };

        let acked = unwrap_seq_before(self.num_sent, (seq.wrapping_add(1) as u16) & SEQ_MASK);
        let advance = acked.wrapping_sub(self.num_acked);
        if advance != 0 && advance <= self.in_flight() {
            trace!("TX ACK for sequence {}: {} packets freed", seq & SEQ_MASK as u32, advance);
            self.num_acked = acked;
            self.num_stalls = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::xport::memory::MemoryZeroCopy;

    async fn send_n(fc: &mut TxFlowControl, xport: &MemoryZeroCopy, n: usize, timeout: Duration) -> Vec<u16> {
        let mut result = Vec::new();
        for _ in 0..n {
            let (buf, seq) = fc.get_tx_buff_with_flowctrl(xport, timeout).await.unwrap().unwrap();
            buf.commit(0).await.unwrap();
            result.push(seq);
        }
        result
    }

    #[test]
    fn test_window_full_times_out() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (_device, host) = MemoryZeroCopy::pair(64, 64);
            let (mut fc, _acks) = TxFlowControl::new(4, 8);

            assert_eq!(send_n(&mut fc, &host, 4, Duration::from_millis(100)).await, vec![0, 1, 2, 3]);
            assert_eq!(fc.in_flight(), 4);

            let start = Instant::now();
            assert!(fc.get_tx_buff_with_flowctrl(&host, Duration::from_millis(100)).await.unwrap().is_none());
            assert_eq!(start.elapsed(), Duration::from_millis(100));
            assert_eq!(fc.in_flight(), 4);
        });
    }

    #[test]
    fn test_ack_frees_window() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (_device, host) = MemoryZeroCopy::pair(64, 64);
            let (mut fc, acks) = TxFlowControl::new(4, 8);
            send_n(&mut fc, &host, 4, Duration::from_millis(100)).await;

            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                acks.ack(1);
            });

            let start = Instant::now();
            let (_buf, seq) = fc.get_tx_buff_with_flowctrl(&host, Duration::from_millis(100)).await.unwrap().unwrap();
            assert_eq!(seq, 4);
            assert_eq!(start.elapsed(), Duration::from_millis(30));
            assert_eq!(fc.in_flight(), 3);
        });
    }

    #[test]
    fn test_return_seq() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (_device, host) = MemoryZeroCopy::pair(64, 64);
            let (mut fc, _acks) = TxFlowControl::new(4, 8);
            send_n(&mut fc, &host, 2, Duration::ZERO).await;

            let (buf, seq) = fc.get_tx_buff_with_flowctrl(&host, Duration::ZERO).await.unwrap().unwrap();
            assert_eq!(seq, 2);
            drop(buf);
            fc.return_seq();

            assert_eq!(fc.in_flight(), 2);
            assert_eq!(fc.next_seq(), 2);
        });
    }

    #[test]
    fn test_repeated_stalls_are_terminal() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (_device, host) = MemoryZeroCopy::pair(64, 64);
            let (mut fc, acks) = TxFlowControl::new(2, 3);
            send_n(&mut fc, &host, 2, Duration::ZERO).await;

            for _ in 0..2 {
                assert!(fc.get_tx_buff_with_flowctrl(&host, Duration::from_millis(10)).await.unwrap().is_none());
            }
            // an ACK in between starts counting anew
            acks.ack(0);
            send_n(&mut fc, &host, 1, Duration::ZERO).await;
            for _ in 0..2 {
                assert!(fc.get_tx_buff_with_flowctrl(&host, Duration::from_millis(10)).await.unwrap().is_none());
            }

            let err = fc.get_tx_buff_with_flowctrl(&host, Duration::from_millis(10)).await.unwrap_err();
            assert_eq!(err.downcast_ref::<TransportError>(), Some(&TransportError::FlowControlStalled { in_flight: 2, stalls: 3 }));
        });
    }

    #[rstest]
    #[case::stale(vec![2, 0], 1)]
    #[case::coalesced(vec![3], 0)]
    #[case::out_of_order(vec![1, 3, 2], 0)]
    #[case::future(vec![10], 4)]
    fn test_ack_accounting(#[case] acks_in: Vec<u32>, #[case] expected_in_flight: u32) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (_device, host) = MemoryZeroCopy::pair(64, 64);
            let (mut fc, acks) = TxFlowControl::new(8, 8);
            send_n(&mut fc, &host, 4, Duration::ZERO).await;

            for seq in acks_in {
                acks.ack(seq);
                fc.apply_latest_ack();
            }
            assert_eq!(fc.in_flight(), expected_in_flight);
        });
    }

    #[test]
    fn test_sequence_wraps() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (_device, host) = MemoryZeroCopy::pair(64, 64);
            let (mut fc, acks) = TxFlowControl::new(16, 8);

            let mut last = 0;
            for _ in 0..5000 {
                let (buf, seq) = fc.get_tx_buff_with_flowctrl(&host, Duration::ZERO).await.unwrap().unwrap();
                drop(buf);
                acks.ack(seq as u32);
                last = seq;
            }
            assert_eq!(last, (4999 % 4096) as u16);
            assert_eq!(fc.next_seq(), (5000 % 4096) as u16);
        });
    }
}
