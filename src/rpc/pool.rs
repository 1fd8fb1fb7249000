//! Reusable byte buffers for bulk payloads.
//!
//! A [`BufferPool`] is handed explicitly to every call that receives a binary
//! payload. Each borrowed [`PooledBuffer`] goes back to the pool when it is
//! dropped, which makes release exactly-once on every exit path.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Default number of idle buffers kept for reuse.
pub const DEFAULT_MAX_IDLE: usize = 8;

/// Default largest buffer handed out (64 MiB, enough for an uncompressed 4K frame).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

struct Inner {
    idle: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
    max_buffer_size: usize,
    outstanding: AtomicUsize,
}

/// A pool of byte buffers shared by cheap clones.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    /// Create a pool keeping up to `max_idle` buffers and refusing borrows
    /// larger than `max_buffer_size`.
    pub fn new(max_idle: usize, max_buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                idle: Mutex::new(Vec::new()),
                max_idle,
                max_buffer_size,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Borrow a zeroed buffer of exactly `len` bytes.
    pub fn borrow(&self, len: usize) -> Result<PooledBuffer> {
        if len > self.inner.max_buffer_size {
            return Err(Error::PayloadTooLarge {
                size: len as u64,
                max: self.inner.max_buffer_size,
            });
        }

        let mut data = {
            let mut idle = self.inner.idle.lock().unwrap_or_else(|e| e.into_inner());
            // Prefer a buffer that already has room.
            match idle.iter().position(|b| b.capacity() >= len) {
                Some(pos) => idle.swap_remove(pos),
                None => idle.pop().unwrap_or_default(),
            }
        };
        data.clear();
        data.resize(len, 0);

        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(PooledBuffer {
            data,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Number of buffers currently borrowed.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Number of idle buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Largest buffer this pool hands out.
    pub fn max_buffer_size(&self) -> usize {
        self.inner.max_buffer_size
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE, DEFAULT_MAX_BUFFER_SIZE)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("outstanding", &self.outstanding())
            .field("idle", &self.idle())
            .field("max_buffer_size", &self.inner.max_buffer_size)
            .finish()
    }
}

/// A buffer borrowed from a [`BufferPool`].
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<Inner>,
}

impl PooledBuffer {
    /// Copy the contents into an owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.clone()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        let data = std::mem::take(&mut self.data);
        let mut idle = self.pool.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.pool.max_idle {
            idle.push(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrow_and_release_accounting() {
        let pool = BufferPool::new(2, 1024);
        let a = pool.borrow(100).unwrap();
        let b = pool.borrow(200).unwrap();
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(a.len(), 100);
        assert_eq!(b.len(), 200);

        drop(a);
        drop(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn reused_buffers_are_zeroed_and_resized() {
        let pool = BufferPool::new(1, 1024);
        let mut first = pool.borrow(8).unwrap();
        first.copy_from_slice(b"dirtydat");
        drop(first);

        let second = pool.borrow(4).unwrap();
        assert_eq!(&second[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn idle_list_is_capped() {
        let pool = BufferPool::new(1, 1024);
        let a = pool.borrow(1).unwrap();
        let b = pool.borrow(1).unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn oversized_borrow_is_refused() {
        let pool = BufferPool::new(1, 16);
        let err = pool.borrow(17).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { size: 17, max: 16 }));
        assert_eq!(pool.outstanding(), 0);
    }
}
