// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Frame buffer recycling.
//!
//! The hot path costs one buffer per inbound packet plus one per fan-out
//! copy. The pool keeps that churn off the allocator: acquire pops a cleared
//! buffer or allocates a fresh one, release zeroes the buffer and offers it
//! back without ever blocking. Zeroing on release is what keeps one client's
//! bytes from leaking into another client's frame.

use std::sync::Mutex;

#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct BufferPool {
    /// Byte capacity of each pooled buffer.
    buf_cap: usize,

    /// Maximum number of retained buffers; release drops the buffer when
    /// the pool is full.
    capacity: usize,

    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool with `capacity` pre-allocated buffers of `buf_cap` bytes.
    #[must_use]
    pub fn new(capacity: usize, buf_cap: usize) -> Self {
        let mut bufs = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            bufs.push(Vec::with_capacity(buf_cap));
        }
        Self {
            buf_cap,
            capacity,
            bufs: Mutex::new(bufs),
        }
    }

    /// Get an empty buffer, reusing a pooled one when available.
    #[must_use]
    pub fn acquire(&self) -> Vec<u8> {
        if let Ok(mut bufs) = self.bufs.lock() {
            if let Some(buf) = bufs.pop() {
                return buf;
            }
        }
        Vec::with_capacity(self.buf_cap)
    }

    /// Clear `buf` and offer it back to the pool.
    ///
    /// The content is zeroed before the length is reset, so a recycled
    /// buffer can never replay a previous frame. A full pool drops the
    /// buffer instead of blocking.
    pub fn release(&self, mut buf: Vec<u8>) {
        for byte in &mut buf {
            *byte = 0;
        }
        buf.clear();

        if let Ok(mut bufs) = self.bufs.lock() {
            if bufs.len() < self.capacity {
                bufs.push(buf);
            }
        }
    }

    /// Number of buffers currently pooled.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.bufs.lock().map_or(0, |bufs| bufs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let pool = BufferPool::new(2, 64);
        assert_eq!(pool.pooled(), 2);

        let mut buf = pool.acquire();
        assert!(buf.is_empty());
        buf.extend_from_slice(b"sensitive bytes");
        pool.release(buf);
        assert_eq!(pool.pooled(), 2);

        let buf = pool.acquire();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_acquire_on_empty_pool_allocates() {
        let pool = BufferPool::new(1, 16);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.pooled(), 0);
        pool.release(a);
        pool.release(b);
        // Second release hits a full pool and drops the buffer.
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_release_zeroes_content() {
        let pool = BufferPool::new(1, 16);
        // Drain the pre-filled buffer so the released one comes back.
        let _ = pool.acquire();

        let mut buf = pool.acquire();
        buf.extend_from_slice(&[0xde, 0xad]);
        pool.release(buf);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        // The recycled allocation was wiped, not merely truncated.
        let spare = unsafe { std::slice::from_raw_parts(buf.as_ptr(), 2) };
        assert_eq!(spare, &[0x00, 0x00]);
    }
}
