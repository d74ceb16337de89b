//! Leased byte buffers.
//!
//! A [`BufferPool`] hands out [`PooledBuffer`]s and takes their storage back
//! when they are dropped, so steady-state traffic does not allocate.
//!
//! Ownership rules:
//! - A `PooledBuffer` has exactly one owner.  Handing it to the send queue is
//!   a move; the sender cannot touch it afterwards.
//! - It is returned to the pool exactly once, on drop (or [`PooledBuffer::release`],
//!   which consumes it).  Use after release does not compile.
//! - `Clone` leases a *new* buffer and copies the bytes.  This is the copy a
//!   retransmitter keeps while the original travels to the socket.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A shared pool of byte vectors.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    /// Upper bound on idle vectors kept for reuse.
    max_idle: usize,
    leased: AtomicUsize,
}

impl BufferPool {
    /// Create a pool that keeps at most `max_idle` returned buffers.
    pub fn new(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            leased: AtomicUsize::new(0),
        })
    }

    /// Lease a zero-filled buffer of exactly `len` bytes.
    pub fn lease(self: &Arc<Self>, len: usize) -> PooledBuffer {
        let mut data = self.free.lock().pop().unwrap_or_default();
        data.clear();
        data.resize(len, 0);
        self.leased.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            data,
            pool: Arc::clone(self),
        }
    }

    /// Lease a buffer holding a copy of `bytes`.
    pub fn copy_from(self: &Arc<Self>, bytes: &[u8]) -> PooledBuffer {
        let mut data = self.free.lock().pop().unwrap_or_default();
        data.clear();
        data.extend_from_slice(bytes);
        self.leased.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            data,
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently leased and not yet returned.
    pub fn leased(&self) -> usize {
        self.leased.load(Ordering::Relaxed)
    }

    /// Idle buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn give_back(&self, data: Vec<u8>) {
        self.leased.fetch_sub(1, Ordering::Relaxed);
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(data);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("leased", &self.leased())
            .field("idle", &self.idle())
            .finish()
    }
}

/// A byte buffer leased from a [`BufferPool`].
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Return the storage to the pool now.
    pub fn release(self) {}

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl Clone for PooledBuffer {
    fn clone(&self) -> Self {
        self.pool.copy_from(&self.data)
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

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.give_back(data);
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_release_balance() {
        let pool = BufferPool::new(8);
        let a = pool.lease(16);
        let b = pool.copy_from(b"abc");
        assert_eq!(pool.leased(), 2);
        assert_eq!(a.len(), 16);
        assert_eq!(&b[..], b"abc");

        a.release();
        drop(b);
        assert_eq!(pool.leased(), 0);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn storage_is_reused_and_cleared() {
        let pool = BufferPool::new(1);
        let mut a = pool.lease(4);
        a.copy_from_slice(&[9, 9, 9, 9]);
        drop(a);

        let b = pool.lease(6);
        assert_eq!(&b[..], &[0; 6]);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn clone_is_an_independent_copy() {
        let pool = BufferPool::new(4);
        let mut original = pool.copy_from(&[1, 2, 3]);
        let copy = original.clone();
        original[0] = 42;

        assert_eq!(&copy[..], &[1, 2, 3]);
        assert_eq!(pool.leased(), 2);
    }

    #[test]
    fn idle_list_is_bounded() {
        let pool = BufferPool::new(2);
        let buffers: Vec<_> = (0..5).map(|_| pool.lease(8)).collect();
        drop(buffers);
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.leased(), 0);
    }
}
