//! Heap Configuration
//!
//! Compile-time defaults for the kernel heap and the runtime [`HeapConfig`]
//! that [`Heap::init`](super::Heap::init) validates before carving a region.
//!
//! # Bin Ladder
//! Fixed bin `i` serves blocks of `min_block_size * growth^i` bytes. The bin
//! after the last fixed bin is the variable bin, which takes whatever is left
//! of the managed region.

use core::fmt;

use super::region::{align_up, is_address_aligned};
use super::variable_bin::{bookkeeping_bytes, MAX_BLOCK_SIZE};
use crate::collections::bitarray::{words_for, Bitarray};

/// Blocks per fixed bin. Also bounds the number of variable-bin blocks.
pub const BLOCKS_PER_BIN: usize = 1024;

/// Bitmap words needed to track [`BLOCKS_PER_BIN`] blocks.
pub const BITMAP_WORDS: usize = words_for(BLOCKS_PER_BIN);

/// Number of fixed-size bins.
pub const NUM_FIXED_BIN: usize = 5;

/// Fixed bins plus the trailing variable bin.
pub const TOTAL_NUM_BIN: usize = NUM_FIXED_BIN + 1;

/// Block size of the smallest bin.
pub const MIN_BIN_BLOCK_SIZE: usize = 16;

/// Ratio between consecutive fixed bin block sizes.
pub const BIN_GROWTH: usize = 2;

/// Upper bound for any fixed bin block size.
pub const MAX_BIN_BLOCK_SIZE: usize = 4096;

/// Largest span of memory a single heap manages (16MB).
pub const MAX_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Alignment of the heap start and of every returned pointer.
pub const HEAP_ALIGN: usize = 8;

/// Bytes reserved for the device tree blob during bring-up.
pub const DTB_MAP_SIZE: usize = 0x1000;

const _: () = assert!(BLOCKS_PER_BIN > 0);
const _: () = assert!(NUM_FIXED_BIN > 0);
const _: () = assert!(HEAP_ALIGN.is_power_of_two());
const _: () = assert!(MIN_BIN_BLOCK_SIZE % HEAP_ALIGN == 0);
const _: () = assert!(BIN_GROWTH >= 2);
const _: () = assert!(HeapConfig::DEFAULT.block_size(NUM_FIXED_BIN - 1) <= MAX_BIN_BLOCK_SIZE);
const _: () = assert!(MAX_HEAP_SIZE - HeapConfig::DEFAULT.fixed_bytes(NUM_FIXED_BIN) <= MAX_BLOCK_SIZE);

/// Runtime heap parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Blocks per fixed bin, and the variable bin's descriptor budget.
    pub blocks_per_bin: usize,
    /// Block size of fixed bin 0 and the smallest block the variable bin
    /// will split off.
    pub min_block_size: usize,
    /// Ratio between consecutive fixed bin block sizes.
    pub growth: usize,
    /// No fixed bin may use blocks larger than this.
    pub max_block_size: usize,
    /// The heap manages at most this many bytes of the region it is given.
    pub max_heap_size: usize,
    /// Retry a full bin's request in the next larger bin instead of failing.
    pub spill_to_larger_bins: bool,
}

impl HeapConfig {
    /// The compile-time defaults.
    pub const DEFAULT: Self = Self {
        blocks_per_bin: BLOCKS_PER_BIN,
        min_block_size: MIN_BIN_BLOCK_SIZE,
        growth: BIN_GROWTH,
        max_block_size: MAX_BIN_BLOCK_SIZE,
        max_heap_size: MAX_HEAP_SIZE,
        spill_to_larger_bins: false,
    };

    /// Block size of fixed bin `bin`. Saturates instead of overflowing.
    pub const fn block_size(&self, bin: usize) -> usize {
        let mut size = self.min_block_size;
        let mut i = 0;
        while i < bin {
            size = size.saturating_mul(self.growth);
            i += 1;
        }
        size
    }

    /// Bytes taken by the first `fixed_bins` fixed bins.
    pub const fn fixed_bytes(&self, fixed_bins: usize) -> usize {
        let mut total = 0usize;
        let mut i = 0;
        while i < fixed_bins {
            total = total.saturating_add(self.block_size(i).saturating_mul(self.blocks_per_bin));
            i += 1;
        }
        total
    }

    /// Check the configuration against a heap of `BINS` bins tracked by
    /// `WORDS`-word bitmaps, managing a region of `available` bytes.
    pub fn validate<const BINS: usize, const WORDS: usize>(
        &self,
        available: usize,
    ) -> Result<HeapPlan, ConfigError> {
        if BINS < 2 {
            return Err(ConfigError::NoFixedBins);
        }
        let fixed_bins = BINS - 1;

        if self.blocks_per_bin == 0 {
            return Err(ConfigError::NoBlocks);
        }
        if self.blocks_per_bin > Bitarray::<WORDS>::CAPACITY {
            return Err(ConfigError::BitmapTooSmall {
                blocks: self.blocks_per_bin,
                capacity: Bitarray::<WORDS>::CAPACITY,
            });
        }
        if self.min_block_size == 0 || !is_address_aligned(self.min_block_size, HEAP_ALIGN) {
            return Err(ConfigError::MisalignedBlockSize(self.min_block_size));
        }
        if self.growth < 2 {
            return Err(ConfigError::FlatGrowth(self.growth));
        }

        let largest = self.block_size(fixed_bins - 1);
        if largest > self.max_block_size {
            return Err(ConfigError::LadderTooTall {
                largest,
                max: self.max_block_size,
            });
        }

        let managed = available.min(self.max_heap_size);
        let fixed_bytes = self.fixed_bytes(fixed_bins);
        let bookkeeping = align_up(bookkeeping_bytes(self.blocks_per_bin), HEAP_ALIGN);
        let needed = fixed_bytes
            .saturating_add(bookkeeping)
            .saturating_add(self.min_block_size);
        if needed > managed {
            return Err(ConfigError::RegionTooSmall { needed, available: managed });
        }

        let variable_bytes = managed - fixed_bytes - bookkeeping;
        if variable_bytes > MAX_BLOCK_SIZE {
            return Err(ConfigError::VariableBinTooLarge(variable_bytes));
        }

        Ok(HeapPlan { managed, fixed_bytes })
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How a validated configuration lays out a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapPlan {
    /// Bytes of the region under management.
    pub managed: usize,
    /// Bytes taken by the fixed bins at the front of the region.
    pub fixed_bytes: usize,
}

/// Configuration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The heap has no fixed bins.
    NoFixedBins,
    /// Zero blocks per bin.
    NoBlocks,
    /// More blocks per bin than the bitmaps can track.
    BitmapTooSmall { blocks: usize, capacity: usize },
    /// The smallest block size is zero or not a multiple of the heap alignment.
    MisalignedBlockSize(usize),
    /// Growth factor below 2.
    FlatGrowth(usize),
    /// The largest fixed bin exceeds the block size limit.
    LadderTooTall { largest: usize, max: usize },
    /// The region cannot hold the fixed bins plus a usable variable bin.
    RegionTooSmall { needed: usize, available: usize },
    /// The variable bin is too large for its block descriptors.
    VariableBinTooLarge(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFixedBins => write!(f, "Heap needs at least one fixed bin"),
            Self::NoBlocks => write!(f, "Bins need at least one block"),
            Self::BitmapTooSmall { blocks, capacity } => {
                write!(f, "{} blocks per bin exceed bitmap capacity {}", blocks, capacity)
            }
            Self::MisalignedBlockSize(size) => {
                write!(f, "Block size {} is not a multiple of {}", size, HEAP_ALIGN)
            }
            Self::FlatGrowth(growth) => write!(f, "Bin growth factor {} is below 2", growth),
            Self::LadderTooTall { largest, max } => {
                write!(f, "Largest bin block size {} exceeds limit {}", largest, max)
            }
            Self::RegionTooSmall { needed, available } => {
                write!(f, "Heap needs {:#x} bytes, region has {:#x}", needed, available)
            }
            Self::VariableBinTooLarge(bytes) => {
                write!(f, "Variable bin of {:#x} bytes cannot be described", bytes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> HeapConfig {
        HeapConfig {
            blocks_per_bin: 8,
            min_block_size: 16,
            growth: 2,
            max_block_size: 64,
            max_heap_size: 1 << 20,
            spill_to_larger_bins: false,
        }
    }

    #[test]
    fn test_block_size_ladder() {
        let config = HeapConfig::DEFAULT;
        assert_eq!(config.block_size(0), 16);
        assert_eq!(config.block_size(1), 32);
        assert_eq!(config.block_size(4), 256);
        assert_eq!(small().fixed_bytes(3), (16 + 32 + 64) * 8);
    }

    #[test]
    fn test_validate_accepts_small_heap() {
        let plan = small().validate::<4, 1>(1 << 20).unwrap();
        assert_eq!(plan.managed, 1 << 20);
        assert_eq!(plan.fixed_bytes, 896);
    }

    #[test]
    fn test_validate_clamps_to_max_heap_size() {
        let config = HeapConfig { max_heap_size: 4096, ..small() };
        let plan = config.validate::<4, 1>(1 << 20).unwrap();
        assert_eq!(plan.managed, 4096);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert_eq!(small().validate::<1, 1>(1 << 20), Err(ConfigError::NoFixedBins));
        assert_eq!(
            HeapConfig { blocks_per_bin: 0, ..small() }.validate::<4, 1>(1 << 20),
            Err(ConfigError::NoBlocks)
        );
        assert_eq!(
            HeapConfig { blocks_per_bin: 65, ..small() }.validate::<4, 1>(1 << 20),
            Err(ConfigError::BitmapTooSmall { blocks: 65, capacity: 64 })
        );
        assert_eq!(
            HeapConfig { min_block_size: 12, ..small() }.validate::<4, 1>(1 << 20),
            Err(ConfigError::MisalignedBlockSize(12))
        );
        assert_eq!(
            HeapConfig { growth: 1, ..small() }.validate::<4, 1>(1 << 20),
            Err(ConfigError::FlatGrowth(1))
        );
        assert_eq!(
            small().validate::<5, 1>(1 << 20),
            Err(ConfigError::LadderTooTall { largest: 128, max: 64 })
        );
    }

    #[test]
    fn test_validate_rejects_tiny_region() {
        match small().validate::<4, 1>(1024) {
            Err(ConfigError::RegionTooSmall { available, .. }) => assert_eq!(available, 1024),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let plan = HeapConfig::default()
            .validate::<TOTAL_NUM_BIN, BITMAP_WORDS>(MAX_HEAP_SIZE)
            .unwrap();
        assert_eq!(plan.managed, MAX_HEAP_SIZE);
    }
}
