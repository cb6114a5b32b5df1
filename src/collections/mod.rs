//! Containers used by the heap's own bookkeeping.
//!
//! Neither container allocates once it is built over caller-supplied
//! storage, so both are usable before the heap exists.

pub mod bitarray;
pub mod sorted_vec;

pub use bitarray::Bitarray;
pub use sorted_vec::{CapacityError, Comparer, NaturalOrder, SortedVec};
