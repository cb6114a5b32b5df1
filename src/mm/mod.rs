//! Memory management for PantherOS
//!
//! Provides:
//! - A segregated-bin kernel heap (fixed-size bins plus one variable-size bin)
//! - A `GlobalAlloc` adapter for the heap
//! - Typed views of raw memory regions
//!
//! # Security Principles
//! - Heap corruption is detected and halts the kernel
//! - Reserved (firmware) memory can never be handed out or freed
//! - Unsafe code is minimal and audited

pub mod bin;
pub mod config;
pub mod fixed_bin;
pub mod global;
pub mod heap;
pub mod region;
pub mod stats;
pub mod variable_bin;

pub use config::{ConfigError, HeapConfig};
pub use global::KernelHeap;
pub use heap::{Heap, HeapError, OomPolicy, Reallocated};
pub use region::Region;
pub use stats::{BinStatistics, CheckFailures, HeapStatistics, SanityReport};
