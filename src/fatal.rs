//! Fatal Error Path
//!
//! Heap corruption is never recoverable. Double frees, foreign pointers,
//! corrupted block sentinels, touching immutable blocks and out-of-memory
//! under [`OomPolicy::Abort`](crate::OomPolicy::Abort) all end here: the
//! failure is logged at error level with the operation name and the
//! addresses/sizes involved, then the kernel panics. The kernel's panic
//! handler halts the CPU.

#[doc(hidden)]
pub use log as __log;

/// Log a fatal heap error and halt.
///
/// The first argument names the failing operation; the rest is a format
/// string with arguments describing the failure.
#[macro_export]
macro_rules! fatal {
    ($op:expr, $($arg:tt)+) => {{
        $crate::fatal::__log::error!("heap: {}: {}", $op, format_args!($($arg)+));
        panic!("heap: {}: {}", $op, format_args!($($arg)+))
    }};
}
