//! A bounded free-list of fixed-size buffers, amortizing allocation on the
//! hot send/receive paths.
//!
//! Grounded on the `Buffers` free-list in `examples/original_source/utils.h`
//! / `utils.cpp`: `get()` pops a free buffer or allocates a new one; `release`
//! (the original's `push_back`) returns it to the free-list and, once the
//! free-list holds more than 3/4 of everything ever allocated (and the total
//! exceeds 16), frees half of it back to the allocator so an idle tunnel
//! doesn't hold onto a transient burst's worth of memory forever.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A single pool-owned chunk. Returned to its pool on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: std::sync::Weak<BufferPoolInner>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn resize(&mut self, len: usize, value: u8) {
        self.data.resize(len, value);
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let mut data = std::mem::take(&mut self.data);
            data.clear();
            pool.release(data);
        }
    }
}

struct BufferPoolInner {
    chunk_size: usize,
    free: Mutex<VecDeque<Vec<u8>>>,
    allocated: std::sync::atomic::AtomicUsize,
}

impl BufferPoolInner {
    fn release(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().unwrap();
        free.push_back(buf);

        let outstanding = free.len();
        let total = self.allocated.load(std::sync::atomic::Ordering::Relaxed);
        if outstanding * 4 > total * 3 && total > 16 {
            let shrink_by = outstanding / 2;
            for _ in 0..shrink_by {
                free.pop_front();
            }
            self.allocated
                .fetch_sub(shrink_by, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

/// Recycles fixed-size buffers of `chunk_size` bytes.
///
/// One instance is shared (via `Arc`) by everything drawing buffers from the
/// same runtime partition: a client tunnel's KCP segments and smux linear
/// buffer chunks, or the server's shared demux socket.
#[derive(Clone)]
pub struct BufferPool {
    inner: std::sync::Arc<BufferPoolInner>,
}

impl BufferPool {
    pub fn new(chunk_size: usize) -> Self {
        BufferPool {
            inner: std::sync::Arc::new(BufferPoolInner {
                chunk_size,
                free: Mutex::new(VecDeque::new()),
                allocated: std::sync::atomic::AtomicUsize::new(0),
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Number of buffers currently sitting in the free-list.
    pub fn size(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    /// Number of buffers ever allocated that haven't been shrunk away.
    pub fn capacity(&self) -> usize {
        self.inner.allocated.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get(&self) -> PooledBuffer {
        let mut data = {
            let mut free = self.inner.free.lock().unwrap();
            match free.pop_front() {
                Some(buf) => buf,
                None => {
                    self.inner
                        .allocated
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    Vec::with_capacity(self.inner.chunk_size)
                }
            }
        };
        data.clear();
        data.resize(self.inner.chunk_size, 0);
        PooledBuffer {
            data,
            pool: std::sync::Arc::downgrade(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_then_release_reuses_backing_storage() {
        let pool = BufferPool::new(64);
        {
            let _buf = pool.get();
            assert_eq!(pool.capacity(), 1);
        }
        assert_eq!(pool.size(), 1);
        let _buf2 = pool.get();
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn bounds_hold_under_churn() {
        let pool = BufferPool::new(32);
        let mut held = Vec::new();
        for _ in 0..64 {
            held.push(pool.get());
        }
        let outstanding = held.len();
        drop(held);

        // pool.size() <= pool.capacity() <= (pool.size() + outstanding) * 4/3 + 16
        assert!(pool.size() <= pool.capacity());
        assert!(pool.capacity() <= (pool.size() + outstanding) * 4 / 3 + 16);
    }

    #[test]
    fn shrinks_once_free_list_dominates() {
        let pool = BufferPool::new(8);
        let mut held = Vec::with_capacity(100);
        for _ in 0..100 {
            held.push(pool.get());
        }
        assert_eq!(pool.capacity(), 100);
        drop(held);
        // freeing all 100 at once triggers multiple shrink passes as the
        // free-list crosses the 3/4 threshold repeatedly.
        assert!(pool.capacity() <= 100);
    }
}
