//! Variable-Size Bin
//!
//! Serves requests of any size from the tail of the heap region. Blocks are
//! described by packed descriptors that live in a private fixed-size bin and
//! are indexed twice: by size for best-fit allocation and by address for
//! pointer lookup and coalescing.
//!
//! # Layout
//! ```text
//! | by-size index | by-address index | descriptor arena | data ............ |
//! ```
//! Everything before the data area is bookkeeping sized for `descriptors`
//! blocks; the data area is what the bin hands out.
//!
//! # Design
//! - Blocks tile the data area without gaps or overlap
//! - Every block is a hole, a present allocation, or immutable (mapped)
//! - No two holes are adjacent once an operation returns
//! - Index entries carry a copy of the block's sort keys; any change to a
//!   block removes its entries, rewrites the descriptor and re-adds them
//!
//! # Security Properties
//! - Descriptors carry head and foot sentinels, checked on every read
//! - Released descriptors are poisoned
//! - Double free, interior pointers and freeing immutable blocks are fatal

use core::cmp::Ordering;
use core::mem::size_of;
use core::ptr::NonNull;

use super::bin::{BinError, Resized};
use super::config::HEAP_ALIGN;
use super::fixed_bin::FixedBin;
use super::region::{align_down, align_up, Region};
use super::stats::BinStatistics;
use crate::collections::sorted_vec::{Comparer, SortedVec};

const OFFSET_BITS: u32 = 32;
const SIZE_BITS: u32 = 30;
const KIND_SHIFT: u32 = OFFSET_BITS + SIZE_BITS;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;

/// Largest block a descriptor can describe, and so the largest data area.
pub const MAX_BLOCK_SIZE: usize = (1 << SIZE_BITS) - 1;

const HEAD_MAGIC: u8 = 0xA1;
const FOOT_MAGIC: u8 = 0x2B;
const POISON: u8 = 0xDE;

/// State of a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockKind {
    /// Free.
    #[default]
    Hole,
    /// Handed out by `allocate`.
    Present,
    /// Reserved by `map`; never freed, resized or split.
    Immutable,
}

impl BlockKind {
    const fn bits(self) -> u64 {
        match self {
            Self::Hole => 0,
            Self::Present => 1,
            Self::Immutable => 2,
        }
    }

    const fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(Self::Hole),
            1 => Some(Self::Present),
            2 => Some(Self::Immutable),
            _ => None,
        }
    }
}

/// Slot number of a descriptor in the arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct BlockId(u32);

/// Decoded descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    id: BlockId,
    /// Byte offset from the start of the data area.
    offset: usize,
    size: usize,
    kind: BlockKind,
}

impl Block {
    #[inline]
    fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// In-memory block descriptor: offset (32 bits), size (30 bits) and kind
/// (2 bits) packed into one word between two sentinel bytes.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct BlockDescriptor {
    head: u8,
    bits: u64,
    foot: u8,
}

const DESCRIPTOR_SIZE: usize = size_of::<BlockDescriptor>();

impl BlockDescriptor {
    const POISONED: Self = Self {
        head: POISON,
        bits: u64::MAX,
        foot: POISON,
    };

    fn encode(block: &Block) -> Self {
        Self {
            head: HEAD_MAGIC,
            bits: block.offset as u64
                | (block.size as u64) << OFFSET_BITS
                | block.kind.bits() << KIND_SHIFT,
            foot: FOOT_MAGIC,
        }
    }

    fn decode(self, id: BlockId) -> Option<Block> {
        if self.head != HEAD_MAGIC || self.foot != FOOT_MAGIC {
            return None;
        }
        let bits = self.bits;
        Some(Block {
            id,
            offset: (bits & OFFSET_MASK) as usize,
            size: ((bits >> OFFSET_BITS) & SIZE_MASK) as usize,
            kind: BlockKind::from_bits(bits >> KIND_SHIFT)?,
        })
    }
}

/// By-size index entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SizeKey {
    size: u32,
    kind: BlockKind,
    offset: u32,
    id: BlockId,
}

impl SizeKey {
    fn of(block: &Block) -> Self {
        Self {
            size: block.size as u32,
            kind: block.kind,
            offset: block.offset as u32,
            id: block.id,
        }
    }
}

/// Size ascending; holes before other blocks of the same size; then address.
struct BySize;

impl Comparer<SizeKey> for BySize {
    fn compare(&self, a: &SizeKey, b: &SizeKey) -> Ordering {
        let taken = |k: &SizeKey| k.kind != BlockKind::Hole;
        a.size
            .cmp(&b.size)
            .then_with(|| taken(a).cmp(&taken(b)))
            .then_with(|| a.offset.cmp(&b.offset))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// By-address index entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct AddrKey {
    offset: u32,
    id: BlockId,
}

impl AddrKey {
    fn of(block: &Block) -> Self {
        Self {
            offset: block.offset as u32,
            id: block.id,
        }
    }
}

struct ByAddr;

impl Comparer<AddrKey> for ByAddr {
    fn compare(&self, a: &AddrKey, b: &AddrKey) -> Ordering {
        a.offset.cmp(&b.offset).then_with(|| a.id.cmp(&b.id))
    }
}

/// Bytes of bookkeeping a variable bin with room for `descriptors` blocks
/// places in front of its data area.
pub const fn bookkeeping_bytes(descriptors: usize) -> usize {
    align_up(descriptors * size_of::<SizeKey>(), HEAP_ALIGN)
        + align_up(descriptors * size_of::<AddrKey>(), HEAP_ALIGN)
        + align_up(descriptors * DESCRIPTOR_SIZE, HEAP_ALIGN)
}

/// The variable-size bin.
pub struct VariableBin<'r, const WORDS: usize> {
    data: Region<'r>,
    /// Bytes in present and immutable blocks.
    allocated: usize,
    /// Smallest block worth splitting off.
    min_block_size: usize,
    descriptors: FixedBin<'r, WORDS>,
    by_size: SortedVec<'r, SizeKey, BySize>,
    by_addr: SortedVec<'r, AddrKey, ByAddr>,
}

impl<'r, const WORDS: usize> VariableBin<'r, WORDS> {
    /// Carve the bookkeeping for `descriptors` blocks from the front of
    /// `region` and serve the rest as one hole.
    ///
    /// # Panics
    /// Panics if `region` does not start on a [`HEAP_ALIGN`] boundary.
    pub fn new(mut region: Region<'r>, descriptors: usize, min_block_size: usize) -> Self {
        let by_size = region
            .take_front(align_up(descriptors * size_of::<SizeKey>(), HEAP_ALIGN))
            .into_slice(SizeKey::default());
        let by_addr = region
            .take_front(align_up(descriptors * size_of::<AddrKey>(), HEAP_ALIGN))
            .into_slice(AddrKey::default());
        let arena = region.take_front(align_up(descriptors * DESCRIPTOR_SIZE, HEAP_ALIGN));

        let mut data = region;
        let len = align_down(data.len().min(MAX_BLOCK_SIZE), HEAP_ALIGN);
        data.truncate(len);

        let mut bin = Self {
            data,
            allocated: 0,
            min_block_size: min_block_size.max(HEAP_ALIGN),
            descriptors: FixedBin::new(arena, DESCRIPTOR_SIZE, descriptors),
            by_size: SortedVec::view(by_size, BySize),
            by_addr: SortedVec::view(by_addr, ByAddr),
        };

        if len > 0 && bin.insert(0, len, BlockKind::Hole).is_err() {
            fatal!("VariableBin::new", "no descriptor for the initial hole");
        }
        log::debug!("Variable bin {:?}, {} descriptors", bin.data, descriptors);
        bin
    }

    #[inline]
    pub fn owns(&self, addr: usize) -> bool {
        self.data.contains(addr)
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.data.start()
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.data.end()
    }

    /// Best-fit allocation of `bytes` bytes, rounded up to [`HEAP_ALIGN`].
    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, BinError> {
        if bytes > MAX_BLOCK_SIZE {
            return Err(BinError::OutOfMemory);
        }
        let size = align_up(bytes.max(1), HEAP_ALIGN);

        let first = self.by_size.partition_point(|k| (k.size as usize) < size);
        let id = self.by_size.as_slice()[first..]
            .iter()
            .find(|k| k.kind == BlockKind::Hole)
            .map(|k| k.id)
            .ok_or(BinError::OutOfMemory)?;

        let hole = self.block(id);
        let leftover = hole.size - size;
        let size = if leftover >= self.min_block_size {
            self.insert(hole.offset + size, leftover, BlockKind::Hole)?;
            size
        } else {
            hole.size
        };

        self.update(Block { size, kind: BlockKind::Present, ..hole });
        self.allocated += size;
        Ok(self.data.ptr_at(hole.offset))
    }

    /// Release the block at `ptr` and coalesce it with neighbouring holes.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        let block = self.lookup(ptr, "VariableBin::deallocate");
        match block.kind {
            BlockKind::Hole => fatal!("VariableBin::deallocate", "double free of {:p}", ptr),
            BlockKind::Immutable => {
                fatal!("VariableBin::deallocate", "block {:p} is immutable", ptr)
            }
            BlockKind::Present => {}
        }

        self.update(Block { kind: BlockKind::Hole, ..block });
        self.allocated -= block.size;
        self.merge_free_blocks();
    }

    /// Resize the block at `ptr`.
    ///
    /// Shrinking splits off the tail when it is worth a block. Growing takes
    /// space from a following hole when there is one, and otherwise allocates
    /// a new block: the returned [`Resized::Moved`] block is live alongside
    /// the old one until the caller copies and frees.
    pub fn reallocate(&mut self, ptr: NonNull<u8>, bytes: usize) -> Result<Resized, BinError> {
        let block = self.lookup(ptr, "VariableBin::reallocate");
        if block.kind != BlockKind::Present {
            fatal!("VariableBin::reallocate", "{:p} is not an allocated block", ptr);
        }

        if bytes == 0 {
            self.deallocate(ptr);
            return Ok(Resized::Freed);
        }
        if bytes > MAX_BLOCK_SIZE {
            return Err(BinError::OutOfMemory);
        }

        let size = align_up(bytes, HEAP_ALIGN);
        match size.cmp(&block.size) {
            Ordering::Equal => Ok(Resized::InPlace(ptr)),
            Ordering::Less => {
                let tail = block.size - size;
                if tail >= self.min_block_size
                    && self.insert(block.offset + size, tail, BlockKind::Hole).is_ok()
                {
                    self.update(Block { size, ..block });
                    self.allocated -= tail;
                    self.merge_free_blocks();
                }
                Ok(Resized::InPlace(ptr))
            }
            Ordering::Greater => {
                self.merge_free_blocks();
                if self.grow_in_place(block, size - block.size) {
                    return Ok(Resized::InPlace(ptr));
                }
                self.allocate(bytes).map(Resized::Moved)
            }
        }
    }

    /// Extend `block` by `need` bytes from the hole right after it.
    fn grow_in_place(&mut self, block: Block, need: usize) -> bool {
        let next = match self.successor(&block) {
            Some(next) if next.kind == BlockKind::Hole && next.size >= need => next,
            _ => return false,
        };

        let excess = next.size - need;
        if excess < self.min_block_size {
            self.remove(next.id);
            self.update(Block { size: block.size + next.size, ..block });
            self.allocated += next.size;
        } else {
            self.update(Block { offset: next.offset + need, size: excess, ..next });
            self.update(Block { size: block.size + need, ..block });
            self.allocated += need;
        }
        true
    }

    /// Turn every byte of `[start, start + len)` inside this bin into
    /// immutable blocks.
    ///
    /// Parts of an affected block outside the range become separate blocks
    /// of the same kind, unless they are smaller than the minimum block size,
    /// in which case they are swallowed by the immutable block. A present
    /// block whose first byte is mapped becomes immutable as a whole.
    pub fn map(&mut self, start: usize, len: usize) {
        let lo = start.max(self.start());
        let hi = start.saturating_add(len).min(self.end());
        if lo >= hi {
            return;
        }
        let map_start = align_down(lo - self.start(), HEAP_ALIGN);
        let map_end = align_up(hi - self.start(), HEAP_ALIGN).min(self.data.len());

        self.merge_free_blocks();
        loop {
            let target = self
                .by_addr
                .iter()
                .map(|k| self.block(k.id))
                .find(|b| b.kind != BlockKind::Immutable && b.offset < map_end && b.end() > map_start);
            let Some(block) = target else { break };

            let left = map_start.saturating_sub(block.offset);
            let right = block.end().saturating_sub(map_end);
            let fixed_start = if left >= self.min_block_size { map_start } else { block.offset };
            // Nobody holds a pointer to the tail of a present block whose start is mapped.
            let orphaned = block.kind == BlockKind::Present && fixed_start == block.offset;
            let fixed_end = if right >= self.min_block_size && !orphaned {
                map_end
            } else {
                block.end()
            };

            self.update(Block {
                offset: fixed_start,
                size: fixed_end - fixed_start,
                kind: BlockKind::Immutable,
                ..block
            });
            if fixed_start > block.offset
                && self.insert(block.offset, fixed_start - block.offset, block.kind).is_err()
            {
                fatal!("VariableBin::map", "out of descriptors splitting {:#x}", block.offset);
            }
            if block.end() > fixed_end
                && self.insert(fixed_end, block.end() - fixed_end, block.kind).is_err()
            {
                fatal!("VariableBin::map", "out of descriptors splitting {:#x}", block.offset);
            }

            if block.kind == BlockKind::Hole {
                self.allocated += fixed_end - fixed_start;
            }
        }
        log::debug!(
            "Variable bin mapped {:#x}..{:#x} immutable",
            self.start() + map_start,
            self.start() + map_end
        );
    }

    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.lookup(ptr, "VariableBin::usable_size").size
    }

    pub fn statistics(&self) -> BinStatistics {
        let holes = self
            .by_size
            .iter()
            .filter(|k| k.kind == BlockKind::Hole)
            .count();
        BinStatistics {
            block_size: None,
            total_bytes: self.data.len(),
            bytes_allocated: self.allocated,
            total_blocks: self.by_addr.len(),
            blocks_allocated: self.by_addr.len() - holes,
        }
    }

    /// Coalesce every run of adjacent holes into one hole.
    fn merge_free_blocks(&mut self) {
        loop {
            let mut merged = false;
            let mut prev: Option<Block> = None;

            for i in 0..self.by_addr.len() {
                let block = self.block(self.by_addr[i].id);
                if block.kind != BlockKind::Hole {
                    prev = None;
                    continue;
                }
                match prev {
                    Some(left) if left.end() == block.offset => {
                        self.remove(block.id);
                        self.update(Block { size: left.size + block.size, ..left });
                        merged = true;
                        break;
                    }
                    _ => prev = Some(block),
                }
            }

            if !merged {
                break;
            }
        }
    }

    /// The block starting exactly at `ptr`. Anything else is fatal.
    fn lookup(&self, ptr: NonNull<u8>, op: &str) -> Block {
        let addr = ptr.as_ptr() as usize;
        if !self.owns(addr) {
            fatal!(op, "{:p} is outside {:?}", ptr, self.data);
        }

        let offset = (addr - self.start()) as u32;
        let index = self.by_addr.partition_point(|k| k.offset < offset);
        match self.by_addr.get(index) {
            Some(k) if k.offset == offset => self.block(k.id),
            _ => fatal!(op, "{:p} is not the start of a block", ptr),
        }
    }

    /// The block right after `block` by address.
    fn successor(&self, block: &Block) -> Option<Block> {
        let offset = block.offset as u32;
        let index = self.by_addr.partition_point(|k| k.offset <= offset);
        self.by_addr.get(index).map(|k| self.block(k.id))
    }

    fn slot(&self, id: BlockId) -> *mut BlockDescriptor {
        self.descriptors.block_at(id.0 as usize).as_ptr().cast()
    }

    /// Read and validate the descriptor of `id`.
    fn block(&self, id: BlockId) -> Block {
        // SAFETY: `id` names an arena block, which is DESCRIPTOR_SIZE bytes of
        // memory owned by this bin. The descriptor is packed, so any address
        // is aligned for it.
        let raw = unsafe { self.slot(id).read() };
        match raw.decode(id) {
            Some(block) => block,
            None => fatal!(
                "VariableBin",
                "corrupted descriptor {} at {:p}",
                id.0,
                self.slot(id)
            ),
        }
    }

    fn store(&mut self, id: BlockId, descriptor: BlockDescriptor) {
        // SAFETY: As in `block`; `&mut self` makes this the only access.
        unsafe { self.slot(id).write(descriptor) };
    }

    /// Describe a new block and index it.
    fn insert(&mut self, offset: usize, size: usize, kind: BlockKind) -> Result<Block, BinError> {
        let slot = self.descriptors.allocate(DESCRIPTOR_SIZE)?;
        let id = BlockId(((slot.as_ptr() as usize - self.descriptors.start()) / DESCRIPTOR_SIZE) as u32);
        let block = Block { id, offset, size, kind };

        self.store(id, BlockDescriptor::encode(&block));
        self.index(&block);
        Ok(block)
    }

    /// Rewrite the descriptor of `block.id` and re-key its index entries.
    fn update(&mut self, block: Block) {
        let old = self.block(block.id);
        self.unindex(&old);
        self.store(block.id, BlockDescriptor::encode(&block));
        self.index(&block);
    }

    /// Drop a block from both indices and release its descriptor.
    fn remove(&mut self, id: BlockId) {
        let old = self.block(id);
        self.unindex(&old);
        self.store(id, BlockDescriptor::POISONED);
        let slot = self.descriptors.block_at(id.0 as usize);
        self.descriptors.deallocate(slot);
    }

    fn index(&mut self, block: &Block) {
        let indexed = self.by_size.add(SizeKey::of(block)).is_ok()
            && self.by_addr.add(AddrKey::of(block)).is_ok();
        if !indexed {
            fatal!("VariableBin", "block index full at {} blocks", self.by_addr.len());
        }
    }

    fn unindex(&mut self, block: &Block) {
        let removed = self.by_size.remove(&SizeKey::of(block))
            && self.by_addr.remove(&AddrKey::of(block));
        if !removed {
            fatal!("VariableBin", "block {:#x} missing from the index", block.offset);
        }
    }
}
