//! Frame buffers for the zero-copy transports: allocated once with the transport's frame size,
//!  then recycled through a [BufferPool](crate::buffers::buffer_pool::BufferPool).
//!
//! A frame buffer has a filled length independent of its capacity. Receiving writes into the
//!  raw capacity and then sets the length; sending appends through `BufMut`.

use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;

/// A frame's worth of pre-allocated memory
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}
impl FixedBuf {
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Set the filled length after writing into the raw memory, e.g. from a socket or DMA read
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "frame length {} exceeds buffer capacity {}", len, self.capacity());
        self.len = len;
    }

    /// The full capacity, regardless of the filled length
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FixedBuf[{}/{}]", self.len, self.capacity())
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}
