//! Fixed-Size Bins
//!
//! Serves blocks of one size from a contiguous span using a bitmap.
//!
//! # Design
//! - Each bit in the bitmap represents one block
//! - Bit = 0: block is free
//! - Bit = 1: block is allocated or reserved
//! - A second bitmap marks reserved (mapped) blocks, which can never be freed
//! - `first_free` caches a block known to be free so that the common
//!   allocate/free pattern avoids a bitmap scan
//!
//! # Security Properties
//! - Double free is detected and is fatal
//! - Freeing a pointer that is not the start of one of this bin's blocks is fatal
//! - Freeing a reserved block is fatal

use core::ptr::NonNull;

use super::bin::{BinError, Resized};
use super::region::Region;
use super::stats::BinStatistics;
use crate::collections::bitarray::Bitarray;

/// A bin of equally sized blocks.
pub struct FixedBin<'r, const WORDS: usize> {
    region: Region<'r>,
    block_size: usize,
    total_blocks: usize,
    /// 1 = allocated or reserved.
    bitmap: Bitarray<WORDS>,
    /// 1 = reserved by `map`.
    reserved: Bitarray<WORDS>,
    allocated: usize,
    first_free: Option<usize>,
}

impl<'r, const WORDS: usize> FixedBin<'r, WORDS> {
    /// Serve `blocks` blocks of `block_size` bytes from the front of `region`.
    ///
    /// # Panics
    /// Panics if the region is too short or the bitmap too small.
    pub fn new(mut region: Region<'r>, block_size: usize, blocks: usize) -> Self {
        assert!(block_size > 0, "fixed bin with zero-sized blocks");
        assert!(
            blocks <= Bitarray::<WORDS>::CAPACITY,
            "{} blocks exceed bitmap capacity {}",
            blocks,
            Bitarray::<WORDS>::CAPACITY
        );
        assert!(
            region.len() >= block_size * blocks,
            "{:?} cannot hold {} blocks of {} bytes",
            region,
            blocks,
            block_size
        );

        region.truncate(block_size * blocks);
        Self {
            region,
            block_size,
            total_blocks: blocks,
            bitmap: Bitarray::new(blocks),
            reserved: Bitarray::new(blocks),
            allocated: 0,
            first_free: if blocks > 0 { Some(0) } else { None },
        }
    }

    #[inline]
    pub fn owns(&self, addr: usize) -> bool {
        self.region.contains(addr)
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.region.start()
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.region.end()
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    #[inline]
    pub fn blocks_allocated(&self) -> usize {
        self.allocated
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.allocated == self.total_blocks
    }

    /// Pointer to the start of block `index`.
    #[inline]
    pub fn block_at(&self, index: usize) -> NonNull<u8> {
        assert!(index < self.total_blocks, "block {} out of range", index);
        self.region.ptr_at(index * self.block_size)
    }

    /// Index of the block starting at `ptr`. Anything else is fatal.
    fn index_of(&self, ptr: NonNull<u8>, op: &str) -> usize {
        let addr = ptr.as_ptr() as usize;
        if !self.owns(addr) {
            fatal!(op, "{:p} is outside {:?}", ptr, self.region);
        }

        let offset = addr - self.start();
        if offset % self.block_size != 0 {
            fatal!(op, "{:p} is not the start of a {}-byte block", ptr, self.block_size);
        }
        offset / self.block_size
    }

    /// Allocate one block for a request of `bytes` bytes.
    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, BinError> {
        if bytes > self.block_size {
            fatal!("FixedBin::allocate", "{} bytes routed to a {}-byte bin", bytes, self.block_size);
        }
        if self.is_full() {
            return Err(BinError::OutOfMemory);
        }

        let index = match self.first_free {
            Some(index) if index < self.total_blocks && !self.bitmap.get(index) => index,
            _ => self.bitmap.find_value(false).ok_or(BinError::OutOfMemory)?,
        };

        self.bitmap.set(index);
        self.allocated += 1;

        // The block right after a fresh allocation is usually free too.
        let next = index + 1;
        self.first_free = if next < self.total_blocks && !self.bitmap.get(next) {
            Some(next)
        } else {
            None
        };

        Ok(self.region.ptr_at(index * self.block_size))
    }

    /// Release the block at `ptr`.
    ///
    /// # Panics
    /// Panics on a foreign or misaligned pointer, a double free, or a reserved
    /// block.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        let index = self.index_of(ptr, "FixedBin::deallocate");
        if self.reserved.get(index) {
            fatal!("FixedBin::deallocate", "block {:p} is reserved", ptr);
        }
        if !self.bitmap.get(index) {
            fatal!("FixedBin::deallocate", "double free of {:p}", ptr);
        }

        self.bitmap.clear(index);
        self.allocated -= 1;

        if self.first_free.map_or(true, |cached| index < cached) {
            self.first_free = Some(index);
        }
    }

    /// Resize the block at `ptr`. Fixed blocks never grow.
    pub fn reallocate(&mut self, ptr: NonNull<u8>, bytes: usize) -> Result<Resized, BinError> {
        let index = self.index_of(ptr, "FixedBin::reallocate");
        if !self.bitmap.get(index) || self.reserved.get(index) {
            fatal!("FixedBin::reallocate", "{:p} is not an allocated block", ptr);
        }

        if bytes == 0 {
            self.deallocate(ptr);
            Ok(Resized::Freed)
        } else if bytes <= self.block_size {
            Ok(Resized::InPlace(ptr))
        } else {
            Err(BinError::MustMove)
        }
    }

    /// Reserve every block that intersects `[start, start + len)`.
    pub fn map(&mut self, start: usize, len: usize) {
        let lo = start.max(self.start());
        let hi = start.saturating_add(len).min(self.end());
        if lo >= hi {
            return;
        }

        let first = (lo - self.start()) / self.block_size;
        let last = (hi - self.start()).div_ceil(self.block_size);

        let before = self.bitmap.popcount();
        self.bitmap.set_range(first, last - first);
        self.reserved.set_range(first, last - first);
        self.allocated += self.bitmap.popcount() - before;

        if self.first_free.is_some_and(|cached| self.bitmap.get(cached)) {
            self.first_free = None;
        }
        log::debug!(
            "Reserved blocks {}..{} of the {}-byte bin",
            first,
            last,
            self.block_size
        );
    }

    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.index_of(ptr, "FixedBin::usable_size");
        self.block_size
    }

    pub fn statistics(&self) -> BinStatistics {
        debug_assert_eq!(self.bitmap.count_ones(), self.allocated);
        BinStatistics {
            block_size: Some(self.block_size),
            total_bytes: self.region.len(),
            bytes_allocated: self.allocated * self.block_size,
            total_blocks: self.total_blocks,
            blocks_allocated: self.allocated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_bin<F: FnOnce(&mut FixedBin<'_, 1>)>(block_size: usize, blocks: usize, f: F) {
        let mut memory = vec![0u64; block_size * blocks / 8 + 1];
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(memory.as_mut_ptr().cast::<u8>(), memory.len() * 8)
        };
        let mut bin = FixedBin::<1>::new(Region::new(bytes), block_size, blocks);
        f(&mut bin);
    }

    #[test]
    fn test_sequential_allocation() {
        with_bin(16, 8, |bin| {
            let a = bin.allocate(16).unwrap();
            let b = bin.allocate(10).unwrap();
            let c = bin.allocate(1).unwrap();
            assert_eq!(a.as_ptr() as usize, bin.start());
            assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 16);
            assert_eq!(c.as_ptr() as usize - b.as_ptr() as usize, 16);
            assert_eq!(bin.blocks_allocated(), 3);
        });
    }

    #[test]
    fn test_freed_block_is_reused() {
        with_bin(16, 8, |bin| {
            let a = bin.allocate(16).unwrap();
            let _b = bin.allocate(16).unwrap();
            let _c = bin.allocate(16).unwrap();
            bin.deallocate(a);
            assert_eq!(bin.allocate(16).unwrap(), a);
        });
    }

    #[test]
    fn test_exhaustion() {
        with_bin(32, 4, |bin| {
            for _ in 0..4 {
                bin.allocate(32).unwrap();
            }
            assert!(bin.is_full());
            assert_eq!(bin.allocate(1), Err(BinError::OutOfMemory));
        });
    }

    #[test]
    fn test_scan_after_cache_miss() {
        with_bin(16, 4, |bin| {
            let blocks: Vec<_> = (0..4).map(|_| bin.allocate(16).unwrap()).collect();
            bin.deallocate(blocks[2]);
            bin.deallocate(blocks[1]);
            assert_eq!(bin.allocate(16).unwrap(), blocks[1]);
            assert_eq!(bin.allocate(16).unwrap(), blocks[2]);
            assert!(bin.is_full());
        });
    }

    #[test]
    fn test_reallocate() {
        with_bin(32, 4, |bin| {
            let a = bin.allocate(8).unwrap();
            assert_eq!(bin.reallocate(a, 32), Ok(Resized::InPlace(a)));
            assert_eq!(bin.reallocate(a, 33), Err(BinError::MustMove));
            assert_eq!(bin.reallocate(a, 0), Ok(Resized::Freed));
            assert_eq!(bin.blocks_allocated(), 0);
        });
    }

    #[test]
    fn test_map_reserves_blocks() {
        with_bin(16, 8, |bin| {
            let start = bin.start();
            bin.map(start + 20, 20);
            // Blocks 1 and 2 intersect [20, 40).
            assert_eq!(bin.blocks_allocated(), 2);

            let a = bin.allocate(16).unwrap();
            assert_eq!(a.as_ptr() as usize, start);
            let b = bin.allocate(16).unwrap();
            assert_eq!(b.as_ptr() as usize, start + 48);

            let stats = bin.statistics();
            assert_eq!(stats.blocks_allocated, 4);
            assert_eq!(stats.bytes_allocated, 64);
        });
    }

    #[test]
    fn test_map_outside_is_ignored() {
        with_bin(16, 8, |bin| {
            let end = bin.end();
            bin.map(end, 64);
            assert_eq!(bin.blocks_allocated(), 0);
        });
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        with_bin(16, 8, |bin| {
            let a = bin.allocate(16).unwrap();
            bin.deallocate(a);
            bin.deallocate(a);
        });
    }

    #[test]
    #[should_panic(expected = "not the start")]
    fn test_interior_pointer_panics() {
        with_bin(16, 8, |bin| {
            let a = bin.allocate(16).unwrap();
            let inner = NonNull::new(a.as_ptr().wrapping_add(4)).unwrap();
            bin.deallocate(inner);
        });
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn test_free_reserved_panics() {
        with_bin(16, 8, |bin| {
            let start = bin.start();
            bin.map(start, 16);
            bin.deallocate(NonNull::new(start as *mut u8).unwrap());
        });
    }
}
