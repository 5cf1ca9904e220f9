use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use crate::xport::{ManagedRecvBuffer, ManagedSendBuffer, ZeroCopyTransport};

/// Receives from a base transport in a dedicated task and queues the received frames, decoupling
///  the medium's receive latency from the application's polling rate. Sending passes straight
///  through to the base transport.
///
/// The queue is bounded; since queued frames still hold their base transport frame slots, the
///  base transport's frame count bounds it as well.
pub struct RecvOffload {
    base: Arc<dyn ZeroCopyTransport>,
    queue: Mutex<mpsc::Receiver<ManagedRecvBuffer>>,
    cancel: CancellationToken,
}

impl RecvOffload {
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(base: Arc<dyn ZeroCopyTransport>, queue_depth: usize) -> RecvOffload {
        let (tx, rx) = mpsc::channel(queue_depth);
        let cancel = CancellationToken::new();

        tokio::spawn(Self::receive_loop(base.clone(), tx, cancel.clone()));

        RecvOffload {
            base,
            queue: Mutex::new(rx),
            cancel,
        }
    }

    async fn receive_loop(base: Arc<dyn ZeroCopyTransport>, tx: mpsc::Sender<ManagedRecvBuffer>, cancel: CancellationToken) {
        debug!("starting receive offload");
        loop {
            let buf = tokio::select! {
                _ = cancel.cancelled() => break,
                buf = base.get_recv_buff(Self::POLL_INTERVAL) => buf,
            };
            let Some(buf) = buf else {
                continue;
            };

            trace!("offloading received frame of {} bytes", buf.len());
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = tx.send(buf) => if result.is_err() {
                    break;
                }
            }
        }
        debug!("receive offload stopped");
    }
}

impl Drop for RecvOffload {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ZeroCopyTransport for RecvOffload {
    async fn get_recv_buff(&self, timeout: Duration) -> Option<ManagedRecvBuffer> {
        tokio::time::timeout(timeout, async {
            self.queue.lock().await.recv().await
        }).await.ok()?
    }

    async fn get_send_buff(&self, timeout: Duration) -> Option<ManagedSendBuffer> {
        self.base.get_send_buff(timeout).await
    }

    fn num_recv_frames(&self) -> usize {
        self.base.num_recv_frames()
    }

    fn recv_frame_size(&self) -> usize {
        self.base.recv_frame_size()
    }

    fn num_send_frames(&self) -> usize {
        self.base.num_send_frames()
    }

    fn send_frame_size(&self) -> usize {
        self.base.send_frame_size()
    }
}
