//! Sorted Vector
//!
//! A resizable ordered sequence that allows duplicate values. Ordering comes
//! from an injected [`Comparer`], so the same element type can be kept in
//! several orders at once (the variable heap bin indexes its blocks by size
//! and by address).
//!
//! # Storage modes
//! - **Owned**: the vector owns a buffer from the global allocator and grows
//!   it on demand, at least doubling the capacity each time.
//! - **View**: the vector wraps caller-supplied storage and never allocates or
//!   frees it. This is how the heap keeps its indices inside memory it
//!   manages itself. A full view rejects further insertions with
//!   [`CapacityError`].

use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;
use core::ops::Index;

/// Orders values of type `T`.
pub trait Comparer<T> {
    /// Compare `a` with `b`.
    fn compare(&self, a: &T, b: &T) -> Ordering;
}

/// Orders values by their [`Ord`] implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NaturalOrder;

impl<T: Ord> Comparer<T> for NaturalOrder {
    #[inline]
    fn compare(&self, a: &T, b: &T) -> Ordering {
        a.cmp(b)
    }
}

impl<T, F> Comparer<T> for F
where
    F: Fn(&T, &T) -> Ordering,
{
    #[inline]
    fn compare(&self, a: &T, b: &T) -> Ordering {
        self(a, b)
    }
}

/// Returned when a view-mode vector has no room left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError {
    /// Capacity of the caller-supplied storage.
    pub capacity: usize,
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sorted vector view is full (capacity {})", self.capacity)
    }
}

enum Storage<'a, T> {
    /// Every slot up to `capacity` is initialised; `len` says how many are live.
    Owned(Vec<T>),
    View(&'a mut [T]),
}

impl<T> Storage<'_, T> {
    #[inline]
    fn slots(&self) -> &[T] {
        match self {
            Self::Owned(buf) => buf,
            Self::View(buf) => buf,
        }
    }

    #[inline]
    fn slots_mut(&mut self) -> &mut [T] {
        match self {
            Self::Owned(buf) => buf,
            Self::View(buf) => buf,
        }
    }
}

/// An ordered, duplicate-permitting vector.
pub struct SortedVec<'a, T, C = NaturalOrder> {
    storage: Storage<'a, T>,
    len: usize,
    comparer: C,
}

impl<T: Copy + Default, C: Comparer<T>> SortedVec<'static, T, C> {
    /// Initial capacity of an owned vector.
    pub const DEFAULT_CAPACITY: usize = 1;

    /// Create an empty owned vector.
    pub fn new(comparer: C) -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY, comparer)
    }

    /// Create an empty owned vector with room for `capacity` elements.
    pub fn with_capacity(capacity: usize, comparer: C) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        buf.resize(capacity, T::default());
        Self {
            storage: Storage::Owned(buf),
            len: 0,
            comparer,
        }
    }
}

impl<'a, T: Copy, C: Comparer<T>> SortedVec<'a, T, C> {
    /// Create an empty vector over caller-owned storage.
    ///
    /// The vector never grows past `buffer.len()` elements and never frees
    /// the buffer.
    pub fn view(buffer: &'a mut [T], comparer: C) -> Self {
        Self {
            storage: Storage::View(buffer),
            len: 0,
            comparer,
        }
    }

    /// Check whether this vector wraps caller-owned storage.
    #[inline]
    pub fn is_view(&self) -> bool {
        matches!(self.storage, Storage::View(_))
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check whether the vector is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements the current storage can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.slots().len()
    }

    /// The live elements, in order.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.storage.slots()[..self.len]
    }

    /// Iterate over the elements in order.
    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Get the element at `index`, if any.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Get the element at `index`.
    ///
    /// # Panics
    /// Panics with the index and size if `index` is out of range.
    pub fn at(&self, index: usize) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => panic!(
                "index {} out of range for container of size {}",
                index, self.len
            ),
        }
    }

    /// The smallest element.
    #[inline]
    pub fn front(&self) -> Option<&T> {
        self.as_slice().first()
    }

    /// The largest element.
    #[inline]
    pub fn back(&self) -> Option<&T> {
        self.as_slice().last()
    }

    /// Index of the first element for which `pred` is false, assuming `pred`
    /// is true for a prefix of the vector.
    #[inline]
    pub fn partition_point<P: FnMut(&T) -> bool>(&self, pred: P) -> usize {
        self.as_slice().partition_point(pred)
    }

    /// Insert `value` after any elements that compare equal to it.
    ///
    /// Returns the index the value was stored at.
    pub fn add(&mut self, value: T) -> Result<usize, CapacityError>
    where
        T: Default,
    {
        if self.len == self.capacity() {
            self.grow(self.len + 1)?;
        }

        let comparer = &self.comparer;
        let index = self.as_slice()
            .partition_point(|e| comparer.compare(e, &value) != Ordering::Greater);

        let len = self.len;
        let slots = self.storage.slots_mut();
        slots.copy_within(index..len, index + 1);
        slots[index] = value;
        self.len += 1;
        Ok(index)
    }

    /// Find the index of the first element equal to `value`.
    pub fn find(&self, value: &T) -> Option<usize> {
        let comparer = &self.comparer;
        let index = self.as_slice()
            .partition_point(|e| comparer.compare(e, value) == Ordering::Less);

        match self.get(index) {
            Some(e) if comparer.compare(e, value) == Ordering::Equal => Some(index),
            _ => None,
        }
    }

    /// Remove the first element equal to `value`.
    ///
    /// Returns `false` if no such element exists.
    pub fn remove(&mut self, value: &T) -> bool {
        match self.find(value) {
            Some(index) => {
                self.remove_at(index);
                true
            }
            None => false,
        }
    }

    /// Remove and return the element at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn remove_at(&mut self, index: usize) -> T {
        let value = *self.at(index);
        let len = self.len;
        self.storage.slots_mut().copy_within(index + 1..len, index);
        self.len -= 1;
        value
    }

    /// Truncate to `next` elements, or make room for at least `next`.
    ///
    /// Growing an owned vector at least doubles its capacity. Growing a view
    /// past its storage fails.
    pub fn resize(&mut self, next: usize) -> Result<(), CapacityError>
    where
        T: Default,
    {
        if next <= self.len {
            self.len = next;
            return Ok(());
        }

        if next > self.capacity() {
            self.grow(next)?;
        }

        Ok(())
    }

    /// Release unused capacity. A view keeps its storage.
    pub fn trim_excess(&mut self) {
        if let Storage::Owned(buf) = &mut self.storage {
            buf.truncate(self.len);
            buf.shrink_to_fit();
        }
    }

    fn grow(&mut self, needed: usize) -> Result<(), CapacityError>
    where
        T: Default,
    {
        let capacity = self.capacity();
        match &mut self.storage {
            Storage::Owned(buf) => {
                let next = needed.max(capacity * 2);
                buf.resize(next, T::default());
                Ok(())
            }
            Storage::View(_) => Err(CapacityError { capacity }),
        }
    }
}

impl<T: Copy, C: Comparer<T>> Index<usize> for SortedVec<'_, T, C> {
    type Output = T;

    #[inline]
    fn index(&self, index: usize) -> &T {
        self.at(index)
    }
}

impl<T: Copy + fmt::Debug, C: Comparer<T>> fmt::Debug for SortedVec<'_, T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_sorted<T: Copy, C: Comparer<T>>(v: &SortedVec<'_, T, C>) -> bool {
        v.as_slice()
            .windows(2)
            .all(|w| v.comparer.compare(&w[0], &w[1]) != Ordering::Greater)
    }

    #[test]
    fn test_add_keeps_order() {
        let mut v = SortedVec::new(NaturalOrder);
        for x in [5, 3, 9, 1, 3, 7, 0, 9] {
            v.add(x).unwrap();
            assert!(is_sorted(&v));
        }
        assert_eq!(v.as_slice(), &[0, 1, 3, 3, 5, 7, 9, 9]);
        assert_eq!(v.front(), Some(&0));
        assert_eq!(v.back(), Some(&9));
    }

    #[test]
    fn test_find_and_remove() {
        let mut v = SortedVec::new(NaturalOrder);
        for x in [4, 8, 15, 16, 23, 42] {
            v.add(x).unwrap();
        }

        assert_eq!(v.find(&15), Some(2));
        assert_eq!(v.find(&5), None);

        assert!(v.remove(&15));
        assert_eq!(v.find(&15), None);
        assert!(!v.remove(&15));
        assert_eq!(v.as_slice(), &[4, 8, 16, 23, 42]);
    }

    #[test]
    fn test_remove_one_duplicate() {
        let mut v = SortedVec::new(NaturalOrder);
        for x in [2, 2, 2] {
            v.add(x).unwrap();
        }
        assert!(v.remove(&2));
        assert_eq!(v.len(), 2);
        assert_eq!(v.find(&2), Some(0));
    }

    #[test]
    fn test_growth_doubles() {
        let mut v = SortedVec::new(NaturalOrder);
        assert_eq!(v.capacity(), 1);
        v.add(1u32).unwrap();
        v.add(2).unwrap();
        assert_eq!(v.capacity(), 2);
        v.add(3).unwrap();
        assert_eq!(v.capacity(), 4);
        v.add(4).unwrap();
        v.add(5).unwrap();
        assert_eq!(v.capacity(), 8);
    }

    #[test]
    fn test_resize_and_trim() {
        let mut v = SortedVec::with_capacity(2, NaturalOrder);
        v.add(1u8).unwrap();
        v.add(2).unwrap();
        v.resize(10).unwrap();
        assert!(v.capacity() >= 10);
        assert_eq!(v.len(), 2);

        v.trim_excess();
        assert_eq!(v.capacity(), 2);

        v.resize(1).unwrap();
        assert_eq!(v.as_slice(), &[1]);
    }

    #[test]
    fn test_custom_comparer() {
        let mut v = SortedVec::new(|a: &i32, b: &i32| b.cmp(a));
        for x in [1, 5, 3] {
            v.add(x).unwrap();
        }
        assert_eq!(v.as_slice(), &[5, 3, 1]);
        assert_eq!(v.find(&3), Some(1));
    }

    #[test]
    fn test_view_is_bounded() {
        let mut storage = [0u16; 3];
        let mut v = SortedVec::view(&mut storage, NaturalOrder);
        assert!(v.is_view());
        v.add(3).unwrap();
        v.add(1).unwrap();
        v.add(2).unwrap();
        assert_eq!(v.add(4), Err(CapacityError { capacity: 3 }));
        assert_eq!(v.as_slice(), &[1, 2, 3]);

        v.trim_excess();
        assert_eq!(v.capacity(), 3);
        assert!(v.resize(5).is_err());

        drop(v);
        assert_eq!(storage, [1, 2, 3]);
    }

    #[test]
    fn test_index() {
        let mut v = SortedVec::new(NaturalOrder);
        v.add(10).unwrap();
        v.add(20).unwrap();
        assert_eq!(v[1], 20);
        assert_eq!(v.get(2), None);
    }

    #[test]
    #[should_panic(expected = "index 2 out of range for container of size 2")]
    fn test_at_out_of_range() {
        let mut v = SortedVec::new(NaturalOrder);
        v.add(10).unwrap();
        v.add(20).unwrap();
        let _ = v.at(2);
    }
}
