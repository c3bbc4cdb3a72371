// Copyright (C) 2021 The rtp-ingest Authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pooled allocation of packet buffers.

use bytes::BytesMut;

const DEFAULT_POOL_SIZE: usize = 64;

/// A freelist of packet buffers.
///
/// Obtained buffers are uniquely owned; callers hand them back with
/// [`PacketPool::recycle`] once downstream is finished. The freelist never
/// holds more than the configured number of buffers.
pub(crate) struct PacketPool {
    free: Vec<BytesMut>,
    size: usize,
}

impl PacketPool {
    pub(crate) fn new() -> Self {
        Self {
            free: Vec::new(),
            size: DEFAULT_POOL_SIZE,
        }
    }

    /// Takes an empty buffer able to hold `capacity` bytes.
    pub(crate) fn obtain(&mut self, capacity: usize) -> BytesMut {
        match self.free.pop() {
            Some(mut buf) => {
                buf.reserve(capacity);
                buf
            }
            None => BytesMut::with_capacity(capacity),
        }
    }

    pub(crate) fn recycle(&mut self, mut buf: BytesMut) {
        if self.free.len() < self.size {
            buf.clear();
            self.free.push(buf);
        }
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
        self.free.truncate(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_buffers_are_reused() {
        let mut pool = PacketPool::new();
        let mut buf = pool.obtain(128);
        buf.extend_from_slice(b"hello");
        let ptr = buf.as_ptr();
        pool.recycle(buf);

        let buf = pool.obtain(16);
        assert!(buf.is_empty());
        assert_eq!(buf.as_ptr(), ptr);
    }

    #[test]
    fn freelist_is_capped() {
        let mut pool = PacketPool::new();
        pool.set_size(1);
        pool.recycle(BytesMut::with_capacity(8));
        pool.recycle(BytesMut::with_capacity(8));
        assert_eq!(pool.free.len(), 1);
    }
}
