//! Bins
//!
//! A bin manages one contiguous sub-range of the heap. The heap holds a fixed
//! array of them: fixed-size bins first, in increasing block size, then the
//! single variable-size bin.

use core::fmt;
use core::ptr::NonNull;

use super::fixed_bin::FixedBin;
use super::stats::BinStatistics;
use super::variable_bin::VariableBin;

/// Recoverable bin failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinError {
    /// No free block can satisfy the request.
    OutOfMemory,
    /// The block cannot grow in this bin; the heap must move it.
    MustMove,
}

impl fmt::Display for BinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "Bin out of memory"),
            Self::MustMove => write!(f, "Block must move to grow"),
        }
    }
}

/// Outcome of resizing a block inside its bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resized {
    /// The block keeps its address.
    InPlace(NonNull<u8>),
    /// The bin handed out a new block. The old one is still allocated; the
    /// caller copies the contents and frees it.
    Moved(NonNull<u8>),
    /// A zero-byte resize released the block.
    Freed,
}

/// One bin of the heap.
pub enum Bin<'r, const WORDS: usize> {
    Fixed(FixedBin<'r, WORDS>),
    Variable(VariableBin<'r, WORDS>),
}

impl<'r, const WORDS: usize> Bin<'r, WORDS> {
    /// Check whether `addr` lies in the memory this bin serves.
    #[inline]
    pub fn owns(&self, addr: usize) -> bool {
        match self {
            Self::Fixed(bin) => bin.owns(addr),
            Self::Variable(bin) => bin.owns(addr),
        }
    }

    /// Check whether `[start, start + len)` intersects this bin's memory.
    pub fn overlaps(&self, start: usize, len: usize) -> bool {
        let (lo, hi) = self.bounds();
        start < hi && start.saturating_add(len) > lo
    }

    /// Largest request the bin serves. Unbounded for the variable bin.
    #[inline]
    pub fn block_size(&self) -> usize {
        match self {
            Self::Fixed(bin) => bin.block_size(),
            Self::Variable(_) => usize::MAX,
        }
    }

    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, BinError> {
        match self {
            Self::Fixed(bin) => bin.allocate(bytes),
            Self::Variable(bin) => bin.allocate(bytes),
        }
    }

    pub fn reallocate(&mut self, ptr: NonNull<u8>, bytes: usize) -> Result<Resized, BinError> {
        match self {
            Self::Fixed(bin) => bin.reallocate(ptr, bytes),
            Self::Variable(bin) => bin.reallocate(ptr, bytes),
        }
    }

    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        match self {
            Self::Fixed(bin) => bin.deallocate(ptr),
            Self::Variable(bin) => bin.deallocate(ptr),
        }
    }

    /// Mark `[start, start + len)` as permanently reserved.
    pub fn map(&mut self, start: usize, len: usize) {
        match self {
            Self::Fixed(bin) => bin.map(start, len),
            Self::Variable(bin) => bin.map(start, len),
        }
    }

    /// Bytes usable behind an allocated pointer.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        match self {
            Self::Fixed(bin) => bin.usable_size(ptr),
            Self::Variable(bin) => bin.usable_size(ptr),
        }
    }

    pub fn statistics(&self) -> BinStatistics {
        match self {
            Self::Fixed(bin) => bin.statistics(),
            Self::Variable(bin) => bin.statistics(),
        }
    }

    fn bounds(&self) -> (usize, usize) {
        match self {
            Self::Fixed(bin) => (bin.start(), bin.end()),
            Self::Variable(bin) => (bin.start(), bin.end()),
        }
    }
}
