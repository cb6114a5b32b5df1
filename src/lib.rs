//! PantherOS Kernel Heap
//!
//! The dynamic memory allocator of the PantherOS ARM64 microkernel.
//!
//! # Design
//! - Small requests are served by fixed-size bins tracked with bitmaps
//! - Everything else comes from one variable-size bin with best-fit
//!   allocation, splitting and coalescing
//! - Firmware data inside the heap region (the device tree blob) can be
//!   reserved so it is never handed out
//!
//! # Security Features
//! - Double free, interior pointers and corrupted bookkeeping halt the kernel
//! - Block descriptors carry sentinels and are poisoned on release
//! - A self-check runs at bring-up before the heap is trusted
//!
//! The crate is `no_std` and only needs `alloc` for owned sorted vectors.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[macro_use]
pub mod fatal;

pub mod collections;
pub mod mm;

pub use mm::{
    BinStatistics, CheckFailures, ConfigError, Heap, HeapConfig, HeapError, HeapStatistics,
    KernelHeap, OomPolicy, Reallocated, Region, SanityReport,
};
