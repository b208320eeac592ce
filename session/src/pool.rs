//! Size-bucketed byte buffer pool.
//!
//! The receive loop and vectored writes churn through short-lived buffers;
//! recycling them through a small free list keeps allocator pressure flat.
//! Semantics are identical to per-use allocation.

use bytes::BytesMut;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Smallest bucket capacity.
const BUCKET_MIN: usize = 1024;

/// Number of power-of-two buckets (1 KiB through 128 KiB).
const BUCKET_COUNT: usize = 8;

/// Buffers retained per bucket; the rest are dropped on release.
const PER_BUCKET: usize = 64;

static GLOBAL: Lazy<BufferPool> = Lazy::new(BufferPool::new);

/// The process-wide pool shared by all sessions.
pub fn buffer_pool() -> &'static BufferPool {
    &GLOBAL
}

/// A free list of reusable byte buffers, bucketed by capacity.
pub struct BufferPool {
    buckets: Vec<Mutex<Vec<BytesMut>>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Smallest bucket whose capacity covers `cap`, if any.
    fn bucket_covering(cap: usize) -> Option<usize> {
        let mut size = BUCKET_MIN;
        for i in 0..BUCKET_COUNT {
            if cap <= size {
                return Some(i);
            }
            size <<= 1;
        }
        None
    }

    /// Largest bucket whose capacity `capacity` can satisfy, if any.
    fn bucket_fitting(capacity: usize) -> Option<usize> {
        let mut fit = None;
        let mut size = BUCKET_MIN;
        for i in 0..BUCKET_COUNT {
            if capacity >= size {
                fit = Some(i);
            }
            size <<= 1;
        }
        fit
    }

    /// Fetch an empty buffer with at least `cap` bytes of capacity.
    pub fn acquire(&self, cap: usize) -> BytesMut {
        match Self::bucket_covering(cap) {
            Some(i) => {
                if let Some(buf) = self.buckets[i].lock().pop() {
                    return buf;
                }
                BytesMut::with_capacity(BUCKET_MIN << i)
            }
            // Oversized requests are served directly by the allocator.
            None => BytesMut::with_capacity(cap),
        }
    }

    /// Return a buffer to the pool.
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        if let Some(i) = Self::bucket_fitting(buf.capacity()) {
            let mut bucket = self.buckets[i].lock();
            if bucket.len() < PER_BUCKET {
                bucket.push(buf);
            }
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
