use std::sync::Mutex;
use tracing::{debug, trace};
use crate::buffers::fixed_buffer::FixedBuf;

/// A pool of equally sized frame buffers. The pool bounds the number of *idle* buffers it keeps;
///  the number of buffers in use is bounded by the owning transport's frame count.
pub struct BufferPool {
    frame_size: usize,
    buffers: Mutex<Vec<FixedBuf>>,
}

impl BufferPool {
    pub fn new(frame_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            frame_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn get_from_pool(&self) -> FixedBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning frame buffer from pool");
                return buffer;
            }
        }

        debug!("no frame buffer in pool: creating new buffer");
        FixedBuf::new(self.frame_size)
    }

    pub fn return_to_pool(&self, mut buffer: FixedBuf) {
        assert_eq!(buffer.capacity(), self.frame_size,
                   "returned buffer does not have the regular frame size of {} bytes", self.frame_size);

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning frame buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned frame buffer");
        }
    }

    #[cfg(test)]
    pub fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
