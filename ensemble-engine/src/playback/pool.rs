//! Recyclable float buffer pool
//!
//! Decode threads rent staging buffers once at startup and on format changes
//! instead of allocating inside their steady-state loop. Returned buffers
//! keep their capacity, so a track that is removed and re-added reuses the
//! allocation of its predecessor.
//!
//! The pool itself takes a mutex; it is only touched from control-plane and
//! decoder threads, never from the audio callback.

use parking_lot::Mutex;
use std::sync::Arc;

/// Shared pool of `Vec<f32>` staging buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Vec<f32>>>,

    /// Capacity given to freshly created buffers
    default_capacity: usize,

    /// Buffers retained after this many are already pooled get dropped
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(default_capacity: usize, max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                default_capacity,
                max_pooled,
            }),
        }
    }

    /// Rent a cleared buffer. Reuses a pooled allocation when available.
    pub fn rent(&self) -> PooledBuffer {
        let mut buffer = {
            let mut free = self.inner.free.lock();
            free.pop()
                .unwrap_or_else(|| Vec::with_capacity(self.inner.default_capacity))
        };
        buffer.clear();
        PooledBuffer {
            buffer,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of buffers currently pooled.
    pub fn pooled(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl PoolInner {
    fn give_back(&self, buffer: Vec<f32>) {
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buffer);
        }
        // else: drop, bounding pool growth
    }
}

/// A rented buffer; returns itself to the pool on drop.
pub struct PooledBuffer {
    buffer: Vec<f32>,
    pool: Arc<PoolInner>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<f32>;

    fn deref(&self) -> &Vec<f32> {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<f32> {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.give_back(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rented_buffer_returns_on_drop() {
        let pool = BufferPool::new(1024, 8);
        assert_eq!(pool.pooled(), 0);

        {
            let mut buf = pool.rent();
            buf.extend_from_slice(&[1.0, 2.0, 3.0]);
        }
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn reuses_allocation() {
        let pool = BufferPool::new(16, 8);
        {
            let mut buf = pool.rent();
            buf.resize(4096, 0.0);
        }

        let buf = pool.rent();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 4096);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn pool_growth_is_bounded() {
        let pool = BufferPool::new(16, 2);
        let a = pool.rent();
        let b = pool.rent();
        let c = pool.rent();
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.pooled(), 2);
    }
}
