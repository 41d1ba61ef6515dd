use std::{mem, ptr::NonNull};

use crate::{
    central_cache::CentralCache,
    chain::UnitList,
    size_class::{self, MAX_CACHED_UNIT_SIZE, NUM_SIZE_CLASSES},
};

/// Cap on the bytes one size-class list may hold, per thread. Going over
/// it spills half the list back to the central cache. For 16 KiB units
/// that means at most 16 cached blocks; for 8 byte units, 32768. A
/// workload touching few fixed sizes could afford a bigger cap, one
/// spraying many sizes would want a smaller one; this is the middle
/// ground the pool ships with.
pub(crate) const MAX_FREE_BYTES_PER_LIST: usize = 256 * 1024;

/// Smallest refill batch ever requested from the central cache.
const MIN_REFILL_COUNT: usize = 4;

/// Top tier of the pool, one instance per thread, completely unshared:
/// the fast path pops a unit off a singly linked list with no
/// synchronization at all. Misses refill from the central cache in
/// batches that double per refill, so a hot class quickly stops paying
/// for the central lock; spills halve the next batch again to damp
/// oscillation.
pub(crate) struct ThreadCache<'a> {
    central: &'a CentralCache<'a>,
    /// Free units of class `i`, owned by this thread.
    free_units: [UnitList; NUM_SIZE_CLASSES],
    /// Batch size to request on the next refill of class `i`.
    next_refill: [usize; NUM_SIZE_CLASSES],
}

impl<'a> ThreadCache<'a> {
    pub fn new(central: &'a CentralCache<'a>) -> Self {
        const EMPTY: UnitList = UnitList::new();

        Self {
            central,
            free_units: [EMPTY; NUM_SIZE_CLASSES],
            next_refill: [0; NUM_SIZE_CLASSES],
        }
    }

    /// Returns a pointer to at least `size` bytes, word aligned, or
    /// `None` if `size` is 0 or the kernel refused memory. Oversize
    /// requests skip the local lists entirely.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let size = size_class::align(size);

        if size > MAX_CACHED_UNIT_SIZE {
            let mut chain = self.central.allocate(size, 1)?;
            return unsafe { chain.pop() };
        }

        let index = size_class::class_index(size);
        if let Some(unit) = unsafe { self.free_units[index].pop() } {
            return Some(unit);
        }

        self.refill(index, size)
    }

    /// Takes back a block previously obtained from [`ThreadCache::allocate`]
    /// with the same `size`. No-op when `size` is 0.
    ///
    /// # Safety
    ///
    /// `address` must come from an `allocate(size)` call on this pool with
    /// the same `size`, and must not be returned twice.
    pub unsafe fn deallocate(&mut self, address: NonNull<u8>, size: usize) {
        if size == 0 {
            return;
        }

        let size = size_class::align(size);

        if size > MAX_CACHED_UNIT_SIZE {
            self.central.deallocate(UnitList::single(address), size);
            return;
        }

        let index = size_class::class_index(size);
        self.free_units[index].push(address);

        if self.free_units[index].len() * size > MAX_FREE_BYTES_PER_LIST {
            let spill_count = self.free_units[index].len() / 2;
            let spilled = self.free_units[index].split_off_front(spill_count);
            debug_assert_eq!(spilled.iter().count(), spill_count);

            self.central.deallocate(spilled, size);
            // Damp the refill size too, this class is clearly over-provisioned.
            self.next_refill[index] /= 2;
        }
    }

    /// Miss path: fetch a batch from the central cache, hand out the first
    /// unit and keep the rest.
    fn refill(&mut self, index: usize, size: usize) -> Option<NonNull<u8>> {
        let count = self.batch_size(index, size);
        let mut chain = self.central.allocate(size, count)?;
        debug_assert_eq!(chain.len(), count);

        let first = unsafe { chain.pop() };
        unsafe { self.free_units[index].prepend(chain) };

        first
    }

    /// Size of the next refill batch: whatever the last call scheduled, at
    /// least [`MIN_REFILL_COUNT`]. Schedules double that for the next
    /// time, clamped so a full batch never exceeds half the list cap (nor,
    /// with debug accounting, what one page span can track).
    fn batch_size(&mut self, index: usize, size: usize) -> usize {
        let result = self.next_refill[index].max(MIN_REFILL_COUNT);

        let mut next = result * 2;
        #[cfg(debug_assertions)]
        {
            next = next.min(crate::page_span::MAX_UNITS_PER_SPAN);
        }
        next = next.min(MAX_FREE_BYTES_PER_LIST / size / 2);
        self.next_refill[index] = next;

        result
    }
}

impl Drop for ThreadCache<'_> {
    /// A thread that exits hands every cached unit back to the central
    /// cache instead of leaking it until process exit.
    fn drop(&mut self) {
        for index in 0..NUM_SIZE_CLASSES {
            let chain = mem::take(&mut self.free_units[index]);
            if !chain.is_empty() {
                self.central.deallocate(chain, size_class::unit_size(index));
            }
        }
    }
}
