//! Aligned block storage for bench I/O.
//!
//! All blocks live in one page-aligned allocation so they can be handed to
//! `O_DIRECT` file descriptors. The pool owns the memory; requests only
//! borrow raw pointers into it, so it must outlive every request in flight.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;

/// Alignment satisfying `O_DIRECT` on common block devices.
pub const BLOCK_ALIGN: usize = 4096;

/// Fixed number of equally sized, aligned blocks.
pub struct BlockPool {
    ptr: *mut u8,
    layout: Layout,
    count: usize,
    block_size: usize,
}

impl BlockPool {
    /// Allocate `count` zeroed blocks of `block_size` bytes.
    ///
    /// # Arguments
    /// * `count` - Number of blocks.
    /// * `block_size` - Size of each block; must be non-zero.
    pub fn new(count: usize, block_size: usize) -> io::Result<Self> {
        if count == 0 || block_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block pool needs at least one non-empty block",
            ));
        }

        let size = count.checked_mul(block_size).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "block pool size overflows")
        })?;
        let layout = Layout::from_size_align(size, BLOCK_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "failed to allocate block pool",
            ));
        }

        Ok(Self {
            ptr,
            layout,
            count,
            block_size,
        })
    }

    /// Number of blocks.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Size of each block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get a block by index.
    ///
    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn block(&self, idx: usize) -> &[u8] {
        assert!(idx < self.count, "block index out of bounds");
        unsafe { std::slice::from_raw_parts(self.ptr.add(idx * self.block_size), self.block_size) }
    }

    /// Get a mutable block by index.
    ///
    /// # Panics
    /// Panics if `idx` is out of bounds.
    pub fn block_mut(&mut self, idx: usize) -> &mut [u8] {
        assert!(idx < self.count, "block index out of bounds");
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.add(idx * self.block_size), self.block_size)
        }
    }

    /// Fill every block with its pattern byte.
    pub fn fill_pattern(&mut self) {
        for idx in 0..self.count {
            self.block_mut(idx).fill(pattern_byte(idx));
        }
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

// Safety: the pool exclusively owns its allocation.
unsafe impl Send for BlockPool {}

/// Byte that block `idx` is filled with by `fill_pattern`.
pub fn pattern_byte(idx: usize) -> u8 {
    (idx % 251) as u8 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_aligned_and_disjoint() {
        let pool = BlockPool::new(4, 4096).unwrap();
        assert_eq!(pool.count(), 4);
        assert_eq!(pool.block_size(), 4096);
        for idx in 0..4 {
            let block = pool.block(idx);
            assert_eq!(block.len(), 4096);
            assert_eq!(block.as_ptr() as usize % BLOCK_ALIGN, 0);
            assert!(block.iter().all(|&b| b == 0));
        }
        assert_eq!(
            pool.block(1).as_ptr() as usize - pool.block(0).as_ptr() as usize,
            4096
        );
    }

    #[test]
    fn test_fill_pattern() {
        let mut pool = BlockPool::new(3, 512).unwrap();
        pool.fill_pattern();
        for idx in 0..3 {
            assert!(pool.block(idx).iter().all(|&b| b == pattern_byte(idx)));
        }
        assert_ne!(pattern_byte(0), pattern_byte(1));
        assert_ne!(pattern_byte(250), 0);
        assert_eq!(pattern_byte(251), pattern_byte(0));
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(BlockPool::new(0, 4096).is_err());
        assert!(BlockPool::new(4, 0).is_err());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_block_out_of_bounds() {
        let pool = BlockPool::new(2, 64).unwrap();
        pool.block(2);
    }
}
