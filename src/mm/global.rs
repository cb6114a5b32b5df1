//! Kernel Global Allocator
//!
//! Plugs a [`Heap`] into Rust's `GlobalAlloc` so that `alloc` collections
//! work in the kernel.
//!
//! # Memory Layout
//! The boot code hands over the span from the end of the loaded kernel image
//! to the top of RAM, see [`Region::from_raw`].
//!
//! # Security Considerations
//! - The heap is initialized once during boot; later calls are ignored
//! - Requests before initialization, or with alignment above
//!   [`HEAP_ALIGN`], fail with a null pointer
//! - Heap corruption detected on free still halts the kernel
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOCATOR: KernelHeap = KernelHeap::new();
//!
//! // in kernel_main:
//! let region = unsafe { Region::from_raw(heap_start, heap_end - heap_start) };
//! ALLOCATOR.init(region, &HeapConfig::DEFAULT, dtb)?;
//! ```

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use spin::Once;

use super::config::{ConfigError, HeapConfig, HEAP_ALIGN};
use super::heap::{Heap, OomPolicy};
use super::region::Region;

/// A lazily initialized kernel heap usable as `#[global_allocator]`.
pub struct KernelHeap {
    heap: Once<Heap<'static>>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self { heap: Once::new() }
    }

    /// Bring up the heap over `region`.
    ///
    /// Must be called once during boot, before the first allocation. Later
    /// or concurrent calls wait for the first one and keep its heap.
    pub fn init(
        &self,
        region: Region<'static>,
        config: &HeapConfig,
        dtb: Option<NonNull<u8>>,
    ) -> Result<&Heap<'static>, ConfigError> {
        let mut built = false;
        let heap = self.heap.try_call_once(|| {
            built = true;
            Heap::bring_up(region, config, dtb)
        })?;

        if !built {
            log::warn!("Kernel heap already initialized at {:#x}", heap.start());
        }
        Ok(heap)
    }

    /// The heap, once initialized.
    #[inline]
    pub fn heap(&self) -> Option<&Heap<'static>> {
        self.heap.get()
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Every pointer handed out is HEAP_ALIGN-aligned and at least
// `layout.size()` bytes long; layouts needing more alignment are refused.
// Blocks are only reused after `dealloc`.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(heap) = self.heap.get() else {
            return ptr::null_mut();
        };
        if layout.align() > HEAP_ALIGN || layout.size() == 0 {
            return ptr::null_mut();
        }

        heap.allocate(layout.size(), OomPolicy::ReturnNull)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let (Some(heap), Some(ptr)) = (self.heap.get(), NonNull::new(ptr)) {
            heap.deallocate(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let (Some(heap), Some(ptr)) = (self.heap.get(), NonNull::new(ptr)) else {
            return ptr::null_mut();
        };
        if layout.align() > HEAP_ALIGN || new_size == 0 {
            return ptr::null_mut();
        }

        match heap.reallocate(ptr, new_size, OomPolicy::ReturnNull) {
            Ok(result) => result.ptr().map_or(ptr::null_mut(), NonNull::as_ptr),
            Err(_) => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_region(len: usize) -> Region<'static> {
        let words: &'static mut [u64] = Box::leak(vec![0u64; len / 8].into_boxed_slice());
        let bytes = unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), len) };
        Region::new(bytes)
    }

    #[test]
    fn test_uninitialized_returns_null() {
        let allocator = KernelHeap::new();
        let layout = Layout::from_size_align(16, 8).unwrap();
        assert!(unsafe { allocator.alloc(layout) }.is_null());
        assert!(allocator.heap().is_none());
    }

    #[test]
    fn test_alloc_dealloc() {
        let allocator = KernelHeap::new();
        allocator
            .init(leaked_region(1 << 20), &HeapConfig::DEFAULT, None)
            .unwrap();

        let layout = Layout::from_size_align(24, 8).unwrap();
        let p = unsafe { allocator.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % HEAP_ALIGN, 0);

        unsafe { allocator.dealloc(p, layout) };
        assert_eq!(allocator.heap().unwrap().statistics().blocks_allocated, 0);
    }

    #[test]
    fn test_overaligned_layout_is_refused() {
        let allocator = KernelHeap::new();
        allocator
            .init(leaked_region(1 << 20), &HeapConfig::DEFAULT, None)
            .unwrap();

        let layout = Layout::from_size_align(64, 64).unwrap();
        assert!(unsafe { allocator.alloc(layout) }.is_null());
    }

    #[test]
    fn test_realloc_preserves_contents() {
        let allocator = KernelHeap::new();
        allocator
            .init(leaked_region(1 << 20), &HeapConfig::DEFAULT, None)
            .unwrap();

        let layout = Layout::from_size_align(16, 8).unwrap();
        let p = unsafe { allocator.alloc(layout) };
        unsafe { p.copy_from_nonoverlapping(b"kernel heap test".as_ptr(), 16) };

        let q = unsafe { allocator.realloc(p, layout, 300) };
        assert!(!q.is_null());
        let moved = unsafe { core::slice::from_raw_parts(q, 16) };
        assert_eq!(moved, b"kernel heap test");

        unsafe { allocator.dealloc(q, Layout::from_size_align(300, 8).unwrap()) };
    }

    #[test]
    fn test_second_init_keeps_heap() {
        let allocator = KernelHeap::new();
        let first = allocator
            .init(leaked_region(1 << 20), &HeapConfig::DEFAULT, None)
            .unwrap()
            .start();
        let second = allocator
            .init(leaked_region(1 << 20), &HeapConfig::DEFAULT, None)
            .unwrap()
            .start();
        assert_eq!(first, second);
    }

    #[test]
    fn test_racing_init_builds_one_heap() {
        let allocator = KernelHeap::new();
        let starts: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let region = leaked_region(1 << 20);
                    let allocator = &allocator;
                    scope.spawn(move || {
                        allocator
                            .init(region, &HeapConfig::DEFAULT, None)
                            .unwrap()
                            .start()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(starts.iter().all(|&start| start == starts[0]));
        assert_eq!(allocator.heap().unwrap().start(), starts[0]);
    }

    #[test]
    fn test_vec_through_heap() {
        let allocator = KernelHeap::new();
        allocator
            .init(leaked_region(1 << 20), &HeapConfig::DEFAULT, None)
            .unwrap();

        let layout = Layout::array::<u32>(1000).unwrap();
        let p = unsafe { allocator.alloc(layout) }.cast::<u32>();
        assert!(!p.is_null());
        for i in 0..1000 {
            unsafe { p.add(i).write(i as u32) };
        }
        assert_eq!(unsafe { p.add(999).read() }, 999);
        unsafe { allocator.dealloc(p.cast(), layout) };
    }
}
