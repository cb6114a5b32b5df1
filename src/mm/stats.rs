//! Heap Statistics and Self-Check Reports

use core::fmt;

use bitflags::bitflags;

/// Usage counters of a single bin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinStatistics {
    /// Block size of a fixed bin; `None` for the variable bin.
    pub block_size: Option<usize>,
    /// Bytes of memory the bin serves from.
    pub total_bytes: usize,
    /// Bytes in allocated or immutable blocks.
    pub bytes_allocated: usize,
    /// Blocks the bin currently tracks.
    pub total_blocks: usize,
    /// Blocks that are allocated or immutable.
    pub blocks_allocated: usize,
}

/// Usage counters of the whole heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    pub num_bins: usize,
    /// Successful allocations since init, including moves.
    pub allocations: usize,
    /// Blocks returned since init, including moves.
    pub frees: usize,
    pub total_bytes: usize,
    pub bytes_allocated: usize,
    pub total_blocks: usize,
    pub blocks_allocated: usize,
}

impl HeapStatistics {
    /// Sum per-bin counters into heap totals.
    pub fn accumulate(&mut self, bin: &BinStatistics) {
        self.num_bins += 1;
        self.total_bytes += bin.total_bytes;
        self.bytes_allocated += bin.bytes_allocated;
        self.total_blocks += bin.total_blocks;
        self.blocks_allocated += bin.blocks_allocated;
    }
}

impl fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bins, {}/{} bytes in use, {}/{} blocks in use, {} allocs, {} frees",
            self.num_bins,
            self.bytes_allocated,
            self.total_bytes,
            self.blocks_allocated,
            self.total_blocks,
            self.allocations,
            self.frees
        )
    }
}

bitflags! {
    /// Kinds of self-check failures.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CheckFailures: u8 {
        /// An allocation that should fit came back empty.
        const NULL = 1 << 0;
        /// A pointer was not aligned to the heap alignment.
        const MISALIGNED = 1 << 1;
        /// Two live allocations shared an address.
        const ALIASED = 1 << 2;
    }
}

/// Outcome of [`Heap::self_check`](super::Heap::self_check).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanityReport {
    pub checks: usize,
    pub failed: usize,
    pub failures: CheckFailures,
}

impl SanityReport {
    /// Record one check.
    pub fn record(&mut self, ok: bool, failure: CheckFailures) {
        self.checks += 1;
        if !ok {
            self.failed += 1;
            self.failures |= failure;
        }
    }

    #[inline]
    pub fn passed(&self) -> bool {
        self.failed == 0
    }
}
