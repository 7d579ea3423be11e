use crate::sync::lock;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
const BLOCKS_PER_SLAB: usize = 32;

/// Slab allocator for I/O buffers.
///
/// Blocks are carved out of large zeroed slabs; a slab is freed once every
/// block (and every `Bytes` frozen from it) has been dropped. Requests larger
/// than a block, and every request after `dispose`, get a standalone allocation.
#[derive(Debug)]
pub struct BufferPool {
    block_size: usize,
    slab: Mutex<BytesMut>,
    disposed: AtomicBool,
}

impl BufferPool {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            slab: Mutex::new(BytesMut::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns a zero-filled buffer of at least `min_size` bytes (`len() == capacity()`).
    pub fn rent(&self, min_size: usize) -> BytesMut {
        if min_size > self.block_size || self.disposed.load(Ordering::Acquire) {
            return BytesMut::zeroed(min_size.max(self.block_size));
        }

        let mut slab = lock(&self.slab);
        if slab.len() < self.block_size {
            *slab = BytesMut::zeroed(self.block_size * BLOCKS_PER_SLAB);
        }
        slab.split_to(self.block_size)
    }

    /// Drops the current slab. Outstanding blocks stay valid.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        *lock(&self.slab) = BytesMut::new();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_carved_from_a_shared_slab() {
        let pool = BufferPool::new(64);
        let a = pool.rent(10);
        let b = pool.rent(64);
        assert_eq!(a.len(), 64);
        assert_eq!(b.len(), 64);
        assert!(a.iter().all(|&x| x == 0));
        // consecutive blocks are adjacent in the same slab
        assert_eq!(a.as_ptr() as usize + 64, b.as_ptr() as usize);
    }

    #[test]
    fn large_requests_and_disposed_pool_allocate_directly() {
        let pool = BufferPool::new(64);
        assert_eq!(pool.rent(100).len(), 100);

        pool.dispose();
        assert!(pool.is_disposed());
        assert_eq!(pool.rent(1).len(), 64);
    }
}
