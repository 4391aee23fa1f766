//! Pooled byte buffers for chunk staging.
//!
//! Decompressed chunks move through short-lived buffers on every read. The
//! pool keeps a bounded free list of them so the hot path does not allocate.
//! A buffer is owned by exactly one party at a time: the pool, an in-flight
//! caller, or a cache that took it over. Whoever ends up with it calls
//! [`BufferPool::put`] (or drops it, which is merely a missed recycle).

use std::sync::Mutex;

pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
}

impl BufferPool {
    /// Create a pool keeping at most `max_buffers` idle buffers around.
    pub fn new(max_buffers: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_buffers,
        }
    }

    /// Take a buffer of exactly `len` bytes out of the pool.
    pub fn get(&self, len: usize) -> Vec<u8> {
        let mut buf = self.free.lock().unwrap().pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Return a buffer to the pool. Buffers above the bound are dropped.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }
        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_buffers {
            free.push(buf);
        }
    }

    /// Number of idle buffers currently pooled.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
