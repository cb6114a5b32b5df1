//! Segregated-Bin Heap
//!
//! The heap takes one contiguous region and splits it into bins: fixed-size
//! bins for small requests (16, 32, 64... bytes) and one variable-size bin
//! covering the rest. Each request goes to the smallest bin whose blocks are
//! large enough.
//!
//! # Memory Layout
//! ```text
//! | bin 0 (16B x N) | bin 1 (32B x N) | ... | variable bin .................. |
//! ^ start (aligned to HEAP_ALIGN)                         end (<= MAX_HEAP_SIZE) ^
//! ```
//!
//! # Security Properties
//! - Every pointer returned is aligned to [`HEAP_ALIGN`]
//! - Double free, interior pointers and freeing reserved memory halt the kernel
//! - Freeing a pointer the heap never managed is logged and ignored
//! - All state sits behind one lock, a spinlock unless the caller picks another

use core::fmt;
use core::ptr::NonNull;

use lock_api::{Mutex, RawMutex};

use super::bin::{Bin, BinError, Resized};
use super::config::{
    ConfigError, HeapConfig, BITMAP_WORDS, DTB_MAP_SIZE, HEAP_ALIGN, TOTAL_NUM_BIN,
};
use super::fixed_bin::FixedBin;
use super::region::{is_address_aligned, Region};
use super::stats::{BinStatistics, CheckFailures, HeapStatistics, SanityReport};
use super::variable_bin::VariableBin;

/// What to do when a request cannot be satisfied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OomPolicy {
    /// Log and halt the kernel.
    #[default]
    Abort,
    /// Log a warning and return [`HeapError::OutOfMemory`].
    ReturnNull,
}

/// Recoverable heap errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No bin could serve the request.
    OutOfMemory { requested: usize },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory allocating {} bytes", requested)
            }
        }
    }
}

/// Outcome of [`Heap::reallocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reallocated {
    /// The block kept its address.
    InPlace(NonNull<u8>),
    /// The contents moved to a new block and the old one was freed.
    Moved(NonNull<u8>),
    /// A zero-byte request freed the block.
    Freed,
}

impl Reallocated {
    /// The block's address after the call, if it is still allocated.
    pub fn ptr(self) -> Option<NonNull<u8>> {
        match self {
            Self::InPlace(ptr) | Self::Moved(ptr) => Some(ptr),
            Self::Freed => None,
        }
    }
}

struct HeapInner<'r, const BINS: usize, const WORDS: usize> {
    bins: [Bin<'r, WORDS>; BINS],
    allocations: usize,
    frees: usize,
    spill: bool,
}

impl<'r, const BINS: usize, const WORDS: usize> HeapInner<'r, BINS, WORDS> {
    fn owner(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        self.bins.iter().position(|bin| bin.owns(addr))
    }

    /// Route `bytes` to the first bin with blocks large enough.
    fn allocate(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        for (index, bin) in self.bins.iter_mut().enumerate() {
            if bytes > bin.block_size() {
                continue;
            }
            match bin.allocate(bytes) {
                Ok(ptr) => {
                    self.allocations += 1;
                    log::trace!("alloc {} bytes -> {:p} (bin {})", bytes, ptr, index);
                    return Some(ptr);
                }
                Err(_) if self.spill => continue,
                Err(_) => return None,
            }
        }
        None
    }

    fn deallocate_in(&mut self, index: usize, ptr: NonNull<u8>) {
        self.bins[index].deallocate(ptr);
        self.frees += 1;
        log::trace!("free {:p} (bin {})", ptr, index);
    }

    fn reallocate(&mut self, ptr: NonNull<u8>, bytes: usize) -> Option<Reallocated> {
        let Some(index) = self.owner(ptr) else {
            fatal!("reallocate", "{:p} is not owned by any bin", ptr)
        };

        let old_size = self.bins[index].usable_size(ptr);
        match self.bins[index].reallocate(ptr, bytes) {
            Ok(Resized::InPlace(ptr)) => Some(Reallocated::InPlace(ptr)),
            Ok(Resized::Freed) => {
                self.frees += 1;
                Some(Reallocated::Freed)
            }
            Ok(Resized::Moved(new)) => {
                self.allocations += 1;
                Some(self.finish_move(index, ptr, new, old_size.min(bytes)))
            }
            Err(BinError::MustMove) => {
                let new = self.allocate(bytes)?;
                Some(self.finish_move(index, ptr, new, old_size.min(bytes)))
            }
            Err(BinError::OutOfMemory) => None,
        }
    }

    fn finish_move(
        &mut self,
        index: usize,
        old: NonNull<u8>,
        new: NonNull<u8>,
        len: usize,
    ) -> Reallocated {
        // SAFETY: `old` and `new` are distinct live blocks of this heap, each
        // at least `len` bytes long.
        unsafe { core::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), len) };
        self.deallocate_in(index, old);
        log::trace!("realloc {:p} -> {:p} ({} bytes copied)", old, new, len);
        Reallocated::Moved(new)
    }
}

/// The kernel heap.
///
/// `BINS` counts every bin, the trailing variable bin included. `WORDS` sizes
/// the per-bin bitmaps. `L` is the lock serializing every operation; any
/// [`RawMutex`] will do, a spinning one by default.
pub struct Heap<
    'r,
    const BINS: usize = TOTAL_NUM_BIN,
    const WORDS: usize = BITMAP_WORDS,
    L: RawMutex = spin::Mutex<()>,
> {
    inner: Mutex<L, HeapInner<'r, BINS, WORDS>>,
    start: usize,
    end: usize,
}

impl<'r, const BINS: usize, const WORDS: usize, L: RawMutex> Heap<'r, BINS, WORDS, L> {
    /// Build a heap over `region`.
    ///
    /// The start is aligned up to [`HEAP_ALIGN`] and at most
    /// `config.max_heap_size` bytes are managed. Fixed bins are carved from
    /// the front in increasing block size; the variable bin takes the rest.
    pub fn init(region: Region<'r>, config: &HeapConfig) -> Result<Self, ConfigError> {
        let mut region = region.align_start(HEAP_ALIGN);
        let plan = config.validate::<BINS, WORDS>(region.len())?;
        region.truncate(plan.managed);

        let (start, end) = (region.start(), region.end());
        let bins = core::array::from_fn(|index| {
            if index + 1 < BINS {
                let block_size = config.block_size(index);
                let span = region.take_front(block_size * config.blocks_per_bin);
                Bin::Fixed(FixedBin::new(span, block_size, config.blocks_per_bin))
            } else {
                let rest = region.take_front(region.len());
                Bin::Variable(VariableBin::new(rest, config.blocks_per_bin, config.min_block_size))
            }
        });

        log::info!(
            "Heap {:#x}..{:#x}: {} fixed bins ({}..{} bytes), variable bin {} bytes",
            start,
            end,
            BINS - 1,
            config.block_size(0),
            config.block_size(BINS - 2),
            end - start - plan.fixed_bytes
        );

        Ok(Self {
            inner: Mutex::new(HeapInner {
                bins,
                allocations: 0,
                frees: 0,
                spill: config.spill_to_larger_bins,
            }),
            start,
            end,
        })
    }

    /// Build a heap, reserve the device tree blob and run the self-check.
    ///
    /// # Panics
    /// Panics if the self-check fails.
    pub fn bring_up(
        region: Region<'r>,
        config: &HeapConfig,
        dtb: Option<NonNull<u8>>,
    ) -> Result<Self, ConfigError> {
        let heap = Self::init(region, config)?;

        match dtb {
            Some(dtb) => heap.map(dtb, DTB_MAP_SIZE),
            None => log::warn!("No device tree blob to reserve"),
        }

        let report = heap.self_check();
        if !report.passed() {
            fatal!(
                "bring_up",
                "{} of {} self-checks failed ({:?})",
                report.failed,
                report.checks,
                report.failures
            );
        }

        log::info!("Heap ready: {}", heap.statistics());
        Ok(heap)
    }

    /// First managed address.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last managed address.
    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Check whether `ptr` lies in the managed range.
    #[inline]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        addr >= self.start && addr < self.end
    }

    /// Allocate `bytes` bytes.
    ///
    /// # Panics
    /// Panics on a zero-byte request, and on exhaustion under
    /// [`OomPolicy::Abort`].
    pub fn allocate(&self, bytes: usize, policy: OomPolicy) -> Result<NonNull<u8>, HeapError> {
        if bytes == 0 {
            fatal!("allocate", "zero-byte request");
        }

        let ptr = self.inner.lock().allocate(bytes);
        match ptr {
            Some(ptr) => Ok(ptr),
            None => out_of_memory(policy, bytes),
        }
    }

    /// Resize the allocation at `ptr` to `bytes` bytes.
    ///
    /// When the block has to move, `min(old size, bytes)` bytes are copied and
    /// the old block is freed. On failure the old block is untouched. A
    /// zero-byte request frees the block.
    ///
    /// # Panics
    /// Panics if `ptr` is not a live allocation of this heap, and on
    /// exhaustion under [`OomPolicy::Abort`].
    pub fn reallocate(
        &self,
        ptr: NonNull<u8>,
        bytes: usize,
        policy: OomPolicy,
    ) -> Result<Reallocated, HeapError> {
        let result = self.inner.lock().reallocate(ptr, bytes);
        match result {
            Some(result) => Ok(result),
            None => out_of_memory(policy, bytes),
        }
    }

    /// Return the allocation at `ptr` to the heap.
    ///
    /// Pointers outside every bin are logged and ignored.
    ///
    /// # Panics
    /// Panics on a double free, an interior pointer, or a reserved block.
    pub fn deallocate(&self, ptr: NonNull<u8>) {
        let mut inner = self.inner.lock();
        match inner.owner(ptr) {
            Some(index) => inner.deallocate_in(index, ptr),
            None => log::warn!("Ignoring free of {:p}: not owned by any bin", ptr),
        }
    }

    /// Reserve `[ptr, ptr + bytes)` permanently, e.g. for firmware data that
    /// lives inside the heap region.
    ///
    /// Every bin intersecting the range reserves its part of it.
    pub fn map(&self, ptr: NonNull<u8>, bytes: usize) {
        if bytes == 0 {
            fatal!("map", "zero-length mapping at {:p}", ptr);
        }

        let start = ptr.as_ptr() as usize;
        let mut inner = self.inner.lock();
        let mut reserved = false;
        for bin in inner.bins.iter_mut().filter(|bin| bin.overlaps(start, bytes)) {
            bin.map(start, bytes);
            reserved = true;
        }

        if reserved {
            log::debug!("Reserved {:#x}..{:#x}", start, start.saturating_add(bytes));
        } else {
            log::warn!(
                "Mapping {:#x}..{:#x} lies outside the heap",
                start,
                start.saturating_add(bytes)
            );
        }
    }

    /// Heap-wide usage counters.
    pub fn statistics(&self) -> HeapStatistics {
        let inner = self.inner.lock();
        let mut stats = HeapStatistics {
            allocations: inner.allocations,
            frees: inner.frees,
            ..HeapStatistics::default()
        };
        for bin in inner.bins.iter() {
            stats.accumulate(&bin.statistics());
        }
        stats
    }

    /// Usage counters of each bin, smallest first.
    pub fn bin_statistics(&self) -> [BinStatistics; BINS] {
        let inner = self.inner.lock();
        core::array::from_fn(|index| inner.bins[index].statistics())
    }

    /// Allocate two blocks from every bin, check them, and free them again.
    pub fn self_check(&self) -> SanityReport {
        let mut report = SanityReport::default();

        let sizes: [usize; BINS] = {
            let inner = self.inner.lock();
            core::array::from_fn(|index| match &inner.bins[index] {
                Bin::Fixed(bin) => bin.block_size(),
                Bin::Variable(_) => match index.checked_sub(1).map(|prev| &inner.bins[prev]) {
                    Some(Bin::Fixed(prev)) => prev.block_size() * 2,
                    _ => HEAP_ALIGN,
                },
            })
        };

        for size in sizes {
            let first = self.allocate(size, OomPolicy::ReturnNull).ok();
            let second = self.allocate(size, OomPolicy::ReturnNull).ok();

            for ptr in [first, second] {
                report.record(ptr.is_some(), CheckFailures::NULL);
                if let Some(ptr) = ptr {
                    let aligned = is_address_aligned(ptr.as_ptr() as usize, HEAP_ALIGN);
                    report.record(aligned, CheckFailures::MISALIGNED);
                }
            }
            if let (Some(a), Some(b)) = (first, second) {
                report.record(a != b, CheckFailures::ALIASED);
            }

            for ptr in [first, second].into_iter().flatten() {
                self.deallocate(ptr);
            }
        }

        log::debug!("Heap self-check: {}/{} passed", report.checks - report.failed, report.checks);
        report
    }
}

fn out_of_memory<T>(policy: OomPolicy, requested: usize) -> Result<T, HeapError> {
    match policy {
        OomPolicy::Abort => fatal!("allocate", "out of memory for {} bytes", requested),
        OomPolicy::ReturnNull => {
            log::warn!("Heap out of memory for {} bytes", requested);
            Err(HeapError::OutOfMemory { requested })
        }
    }
}
