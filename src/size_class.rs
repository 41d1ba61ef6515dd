use std::mem;

/// Minimum alignment and minimum allocation size, one machine word. Every
/// request is rounded up to a multiple of this, which also guarantees that
/// the first word of a free unit can hold the next pointer of its chain.
/// See [`crate::chain`].
pub(crate) const ALIGNMENT: usize = mem::size_of::<usize>();

/// Virtual memory page size. The page cache only ever talks to the kernel
/// in multiples of this.
pub(crate) const PAGE_SIZE: usize = 4096;

/// Largest unit size served by the tiered caches. Anything strictly larger
/// goes straight to the system allocator through the page cache's unit
/// path.
pub(crate) const MAX_CACHED_UNIT_SIZE: usize = 16 * 1024;

/// Number of size classes. Class `i` holds units of `(i + 1) * ALIGNMENT`
/// bytes, so the classes cover every aligned size up to
/// [`MAX_CACHED_UNIT_SIZE`].
pub(crate) const NUM_SIZE_CLASSES: usize = MAX_CACHED_UNIT_SIZE / ALIGNMENT;

/// Rounds `size` up to a multiple of `alignment`. `alignment` must be a
/// power of two.
#[inline]
pub(crate) fn align_to(size: usize, alignment: usize) -> usize {
    (size + alignment - 1) & !(alignment - 1)
}

/// Rounds `size` up to the machine word boundary.
///
/// # Examples
///
/// On a 64 bit machine:
///
/// ```ignore
/// assert_eq!(align(1), 8);
/// assert_eq!(align(13), 16);
/// assert_eq!(align(16), 16);
/// ```
#[inline]
pub(crate) fn align(size: usize) -> usize {
    align_to(size, ALIGNMENT)
}

/// Returns the size class index for `size`. Not defined for `size == 0`,
/// callers reject that before reaching any class math.
#[inline]
pub(crate) fn class_index(size: usize) -> usize {
    debug_assert!(size > 0);
    align(size) / ALIGNMENT - 1
}

/// Unit size of class `index`.
#[inline]
pub(crate) fn unit_size(index: usize) -> usize {
    (index + 1) * ALIGNMENT
}
