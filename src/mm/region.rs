//! Managed Memory Regions
//!
//! A [`Region`] is a non-owning view of a contiguous span of memory handed to
//! the heap. The heap carves it into bins by byte length and places its own
//! bookkeeping (sorted indices, block descriptors) inside it through typed
//! views.
//!
//! # Safety Properties
//! - A region is created either from a `&mut [u8]` (safe, borrow-checked) or
//!   from a raw address range (unsafe, the boot code vouches for it)
//! - Carved sub-regions never overlap, so typed views never alias
//! - The heap never forms references into the memory it hands out, it only
//!   computes addresses

use core::fmt;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

/// Check whether `address` is a multiple of `boundary` (a power of two).
#[inline]
pub const fn is_address_aligned(address: usize, boundary: usize) -> bool {
    address & (boundary - 1) == 0
}

/// Align `address` down to a multiple of `boundary` (a power of two).
#[inline]
pub const fn align_down(address: usize, boundary: usize) -> usize {
    address & !(boundary - 1)
}

/// Align `address` up to a multiple of `boundary` (a power of two).
#[inline]
pub const fn align_up(address: usize, boundary: usize) -> usize {
    (address + boundary - 1) & !(boundary - 1)
}

/// Align `address` down in place and return how many bytes it moved.
#[inline]
pub fn make_address_aligned(address: &mut usize, boundary: usize) -> usize {
    let next = align_down(*address, boundary);
    let diff = *address - next;
    *address = next;
    diff
}

/// A contiguous span of memory under heap management.
pub struct Region<'r> {
    base: NonNull<u8>,
    len: usize,
    _memory: PhantomData<&'r mut [u8]>,
}

// SAFETY: A region grants exclusive access to its bytes, exactly like the
// `&mut [u8]` it stands in for.
unsafe impl Send for Region<'_> {}

impl<'r> Region<'r> {
    /// Create a region over borrowed memory.
    pub fn new(memory: &'r mut [u8]) -> Self {
        let len = memory.len();
        Self {
            base: NonNull::from(memory).cast::<u8>(),
            len,
            _memory: PhantomData,
        }
    }
}

impl Region<'static> {
    /// Create a region from a raw address range, e.g. from the end of the
    /// loaded kernel image up to the top of RAM.
    ///
    /// # Safety
    /// - `start` must be non-null
    /// - `start..start + len` must be valid, writable memory for the rest of
    ///   the kernel's lifetime
    /// - Nothing else may access that memory except through the heap
    pub unsafe fn from_raw(start: usize, len: usize) -> Self {
        Self {
            // SAFETY: The caller guarantees `start` is non-null.
            base: unsafe { NonNull::new_unchecked(start as *mut u8) },
            len,
            _memory: PhantomData,
        }
    }
}

impl<'r> Region<'r> {
    /// Start address.
    #[inline]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the last address.
    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.len
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check whether the region holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check whether `address` lies inside the region.
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start() && address < self.end()
    }

    /// Pointer to the byte at `offset`.
    ///
    /// # Panics
    /// Panics if `offset` is past the end of the region.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.len, "offset {:#x} outside {:?}", offset, self);
        // SAFETY: `offset` is within the region (or one past its end), so the
        // result stays inside the same allocation and is non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Drop leading bytes until the start is a multiple of `boundary`.
    pub fn align_start(mut self, boundary: usize) -> Self {
        let skip = (align_up(self.start(), boundary) - self.start()).min(self.len);
        self.base = self.ptr_at(skip);
        self.len -= skip;
        self
    }

    /// Shorten the region to at most `len` bytes.
    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Split off the first `len` bytes (clamped to what is left) as a separate
    /// region.
    pub fn take_front(&mut self, len: usize) -> Region<'r> {
        let len = len.min(self.len);
        let front = Region {
            base: self.base,
            len,
            _memory: PhantomData,
        };
        self.base = self.ptr_at(len);
        self.len -= len;
        front
    }

    /// Turn the region into a typed slice, writing `fill` into every slot.
    ///
    /// Trailing bytes that do not make up a whole `T` are left unused.
    ///
    /// # Panics
    /// Panics if `T` is zero-sized or the start is not aligned for `T`.
    pub fn into_slice<T: Copy>(self, fill: T) -> &'r mut [T] {
        assert!(size_of::<T>() > 0, "typed view of a zero-sized type");
        assert!(
            is_address_aligned(self.start(), align_of::<T>()),
            "{:?} is not aligned for a typed view",
            self
        );

        let count = self.len / size_of::<T>();
        let slots = self.base.as_ptr().cast::<T>();
        for i in 0..count {
            // SAFETY: `i < count`, so slot `i` lies inside the region, and the
            // start is aligned for `T`.
            unsafe { slots.add(i).write(fill) };
        }

        // SAFETY: All `count` slots were initialised above. The region is
        // consumed, so no other view of these bytes exists for `'r`.
        unsafe { core::slice::from_raw_parts_mut(slots, count) }
    }
}

impl fmt::Debug for Region<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region({:#018x}..{:#018x})", self.start(), self.end())
    }
}
