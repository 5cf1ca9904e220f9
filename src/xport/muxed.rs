use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use crate::error::TransportError;
use crate::sid::Sid;
use crate::xport::{ManagedRecvBuffer, ManagedSendBuffer, ZeroCopyTransport};

/// Maps a received frame to the key of the virtual stream it belongs to
pub type StreamKeyExtractor = Arc<dyn Fn(&[u8]) -> Option<u32> + Send + Sync>;

/// Splits one physical transport into virtual streams, demultiplexing received frames by a key
///  extracted from each frame (typically a part of the SID).
///
/// There is no dedicated receive task: whichever virtual stream is waiting for data pulls frames
///  from the base transport and routes frames for other streams into their queues. Frames with
///  a key that no virtual stream is registered for are dropped. Sending is not multiplexed and
///  goes straight to the base transport.
pub struct MuxedTransport {
    base: Arc<dyn ZeroCopyTransport>,
    extractor: StreamKeyExtractor,
    max_streams: usize,
    streams: Mutex<FxHashMap<u32, mpsc::Sender<ManagedRecvBuffer>>>,
    base_recv: tokio::sync::Mutex<()>,
}

impl MuxedTransport {
    /// base transport receive timeout while pulling on behalf of a virtual stream
    const PULL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(base: Arc<dyn ZeroCopyTransport>, extractor: StreamKeyExtractor, max_streams: usize) -> Arc<MuxedTransport> {
        Arc::new(MuxedTransport {
            base,
            extractor,
            max_streams,
            streams: Default::default(),
            base_recv: Default::default(),
        })
    }

    pub fn make_stream(self: &Arc<Self>, key: u32) -> anyhow::Result<Arc<MuxedStream>> {
        let mut streams = self.streams.lock().unwrap();
        if streams.contains_key(&key) {
            return Err(TransportError::InvalidArgument(format!("a virtual stream for key {:#x} exists already", key)).into());
        }
        if streams.len() >= self.max_streams {
            return Err(TransportError::ResourceExhausted {
                resource: "virtual streams",
                sid: Sid::from_raw(key),
                capacity: self.max_streams,
            }.into());
        }

        // queued frames hold base transport frames: an idle stream may only pin its share of them
        let (tx, rx) = mpsc::channel(self.queue_capacity());
        streams.insert(key, tx);
        debug!("registered virtual stream {:#x} ({} of {})", key, streams.len(), self.max_streams);

        Ok(Arc::new(MuxedStream {
            mux: self.clone(),
            key,
            queue: tokio::sync::Mutex::new(rx),
        }))
    }

    /// frames a virtual stream's queue can hold
    pub fn queue_capacity(&self) -> usize {
        (self.base.num_recv_frames() / self.max_streams.max(1)).max(1)
    }

    pub fn num_streams(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Receive one frame from the base transport. Returns it if it belongs to `key`, otherwise
    ///  routes it and returns `None`.
    async fn pull_from_base(&self, key: u32) -> Option<ManagedRecvBuffer> {
        let _guard = self.base_recv.lock().await;
        let buf = self.base.get_recv_buff(Self::PULL_INTERVAL).await?;

        let Some(buf_key) = (self.extractor)(buf.as_ref()) else {
            warn!("dropping frame of {} bytes without a stream key", buf.len());
            return None;
        };
        if buf_key == key {
            return Some(buf);
        }

        let streams = self.streams.lock().unwrap();
        match streams.get(&buf_key) {
            Some(tx) => {
                trace!("routing frame for stream {:#x}", buf_key);
                if tx.try_send(buf).is_err() {
                    warn!("queue of virtual stream {:#x} is full - dropping frame", buf_key);
                }
            }
            None => warn!("dropping frame for unregistered stream {:#x}", buf_key),
        }
        None
    }

    fn unregister(&self, key: u32) {
        self.streams.lock().unwrap().remove(&key);
        debug!("unregistered virtual stream {:#x}", key);
    }
}

/// One virtual stream of a [MuxedTransport]
pub struct MuxedStream {
    mux: Arc<MuxedTransport>,
    key: u32,
    queue: tokio::sync::Mutex<mpsc::Receiver<ManagedRecvBuffer>>,
}

impl MuxedStream {
    pub fn key(&self) -> u32 {
        self.key
    }
}

impl Drop for MuxedStream {
    fn drop(&mut self) {
        self.mux.unregister(self.key);
    }
}

#[async_trait]
impl ZeroCopyTransport for MuxedStream {
    async fn get_recv_buff(&self, timeout: Duration) -> Option<ManagedRecvBuffer> {
        tokio::time::timeout(timeout, async {
            let mut queue = self.queue.lock().await;
            loop {
                tokio::select! {
                    biased;
                    buf = queue.recv() => return buf,
                    pulled = self.mux.pull_from_base(self.key) => if pulled.is_some() {
                        return pulled;
                    }
                }
            }
        }).await.ok()?
    }

    async fn get_send_buff(&self, timeout: Duration) -> Option<ManagedSendBuffer> {
        self.mux.base.get_send_buff(timeout).await
    }

    fn num_recv_frames(&self) -> usize {
        self.mux.base.num_recv_frames()
    }

    fn recv_frame_size(&self) -> usize {
        self.mux.base.recv_frame_size()
    }

    fn num_send_frames(&self) -> usize {
        self.mux.base.num_send_frames()
    }

    fn send_frame_size(&self) -> usize {
        self.mux.base.send_frame_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use crate::xport::memory::MemoryZeroCopy;

    fn first_byte() -> StreamKeyExtractor {
        Arc::new(|frame: &[u8]| frame.first().map(|b| *b as u32))
    }

    #[rstest]
    #[case::a_only(vec![1, 1, 1])]
    #[case::b_only(vec![2, 2])]
    #[case::alternating(vec![1, 2, 1, 2, 1, 2])]
    #[case::b_first(vec![2, 2, 2, 1, 1, 2])]
    #[case::with_unregistered(vec![3, 1, 3, 2, 3])]
    fn test_demux(#[case] keys: Vec<u8>) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (device, host) = MemoryZeroCopy::pair(64, 16);
            let mux = MuxedTransport::new(Arc::new(host), first_byte(), 4);
            let a = mux.make_stream(1).unwrap();
            let b = mux.make_stream(2).unwrap();

            for (i, key) in keys.iter().enumerate() {
                device.send_bytes(&[*key, i as u8], Duration::ZERO).await.unwrap();
            }

            let expected_a: Vec<Vec<u8>> = keys.iter().enumerate().filter(|(_, k)| **k == 1).map(|(i, k)| vec![*k, i as u8]).collect();
            let expected_b: Vec<Vec<u8>> = keys.iter().enumerate().filter(|(_, k)| **k == 2).map(|(i, k)| vec![*k, i as u8]).collect();

            // a reads first, which routes b's frames into b's queue
            let mut actual_a = Vec::new();
            while let Some(buf) = a.get_recv_buff(Duration::from_millis(500)).await {
                actual_a.push(buf.as_ref().to_vec());
            }
            let mut actual_b = Vec::new();
            while let Some(buf) = b.get_recv_buff(Duration::from_millis(500)).await {
                actual_b.push(buf.as_ref().to_vec());
            }

            assert_eq!(actual_a, expected_a);
            assert_eq!(actual_b, expected_b);
        });
    }

    #[test]
    fn test_max_streams() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (_device, host) = MemoryZeroCopy::pair(64, 4);
            let mux = MuxedTransport::new(Arc::new(host), first_byte(), 2);

            let a = mux.make_stream(1).unwrap();
            let _b = mux.make_stream(2).unwrap();
            let err = mux.make_stream(3).err().unwrap();
            assert!(matches!(err.downcast_ref::<TransportError>(), Some(TransportError::ResourceExhausted { .. })));

            drop(a);
            assert_eq!(mux.num_streams(), 1);
            mux.make_stream(3).unwrap();
        });
    }

    #[test]
    fn test_duplicate_key() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (_device, host) = MemoryZeroCopy::pair(64, 4);
            let mux = MuxedTransport::new(Arc::new(host), first_byte(), 2);
            let _a = mux.make_stream(1).unwrap();
            assert!(mux.make_stream(1).is_err());
        });
    }

    #[test]
    fn test_send_passes_through() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (device, host) = MemoryZeroCopy::pair(64, 4);
            let mux = MuxedTransport::new(Arc::new(host), first_byte(), 2);
            let a = mux.make_stream(1).unwrap();

            let mut buf = a.get_send_buff(Duration::ZERO).await.unwrap();
            bytes::BufMut::put_slice(buf.buf_mut(), b"up");
            buf.commit(2).await.unwrap();

            assert_eq!(device.get_recv_buff(Duration::ZERO).await.unwrap().as_ref(), b"up");
        });
    }

    #[test]
    fn test_idle_stream_does_not_starve_others() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (device, host) = MemoryZeroCopy::pair(64, 4);
            let mux = MuxedTransport::new(Arc::new(host), first_byte(), 2);
            assert_eq!(mux.queue_capacity(), 2);
            let a = mux.make_stream(1).unwrap();
            let b = mux.make_stream(2).unwrap();

            // nobody reads b: its queue fills up, and the frames beyond that are dropped
            for i in 0..4 {
                device.send_bytes(&[2, i], Duration::ZERO).await.unwrap();
            }
            assert!(a.get_recv_buff(Duration::from_millis(500)).await.is_none());

            device.send_bytes(&[1, 4], Duration::ZERO).await.unwrap();
            device.send_bytes(&[1, 5], Duration::ZERO).await.unwrap();
            assert_eq!(a.get_recv_buff(Duration::from_millis(500)).await.unwrap().as_ref(), &[1, 4]);
            assert_eq!(a.get_recv_buff(Duration::from_millis(500)).await.unwrap().as_ref(), &[1, 5]);

            assert_eq!(b.get_recv_buff(Duration::from_millis(500)).await.unwrap().as_ref(), &[2, 0]);
            assert_eq!(b.get_recv_buff(Duration::from_millis(500)).await.unwrap().as_ref(), &[2, 1]);
            assert!(b.get_recv_buff(Duration::from_millis(500)).await.is_none());
        });
    }
}
