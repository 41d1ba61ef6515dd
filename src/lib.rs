//! Three-tier memory pool with sized deallocation. The pool serves the
//! classic pair of operations, [`allocate`] and [`deallocate`], tuned for
//! multi-threaded workloads whose objects are smaller than 16 KiB.
//!
//! Allocations flow down through three tiers and deallocations bubble
//! back up, each tier deciding on its own hysteresis when to escalate:
//!
//! ```text
//!  allocate(n) / deallocate(p, n)
//!        |
//!        v
//! +---------------+   one per thread, unsynchronized. Singly linked
//! |  ThreadCache  |   free list per size class, refilled and spilled
//! +---------------+   in adaptive batches.
//!        |
//!        v
//! +---------------+   process singleton, one spinlock per size class.
//! | CentralCache  |   Carves page runs into fixed-size units, tracks
//! +---------------+   each run in a PageSpan until its units return.
//!        |
//!        v
//! +---------------+   process singleton behind one mutex. Free runs of
//! |   PageCache   |   pages indexed by length and by address, adjacent
//! +---------------+   runs coalesced, mappings bulk-requested from the
//!        |            kernel and kept until process exit.
//!        v
//!      mmap
//! ```
//!
//! Requests larger than 16 KiB skip all of this and go straight to the
//! system allocator, wrapped so the two entry points stay the only
//! surface.
//!
//! # Sized deallocation
//!
//! [`deallocate`] requires the same `size` that was passed to
//! [`allocate`]. That single contract deviation from the system allocator
//! is what lets the pool route every operation by size class without
//! storing any per-pointer metadata: a free unit is nothing but its own
//! first word pointing at the next free unit.
//!
//! # Example
//!
//! ```rust
//! let size = 512;
//! let block = tierloc::allocate(size).unwrap();
//!
//! unsafe {
//!     block.as_ptr().write_bytes(0xAB, size);
//!     tierloc::deallocate(block, size);
//! }
//! ```

use std::{cell::RefCell, ptr::NonNull};

mod central_cache;
mod chain;
mod page_cache;
mod page_span;
mod platform;
mod size_class;
mod span;
mod spin;
mod thread_cache;

use central_cache::CentralCache;
use thread_cache::ThreadCache;

/// A possibly-absent non-null pointer. Preferred over `*mut T` so that
/// every "no pointer here" case is an explicit `None` the compiler makes
/// us handle.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

thread_local! {
    /// Created on this thread's first allocation; its destructor spills
    /// every cached unit back to the central cache when the thread exits.
    static THREAD_CACHE: RefCell<ThreadCache<'static>> =
        RefCell::new(ThreadCache::new(CentralCache::instance()));
}

/// Returns a pointer to at least `size` bytes, aligned to at least one
/// machine word, or `None` when `size` is 0 or the kernel refuses memory.
///
/// The block stays valid until it is passed to [`deallocate`] with the
/// same `size`.
pub fn allocate(size: usize) -> Option<NonNull<u8>> {
    match THREAD_CACHE.try_with(|cache| cache.borrow_mut().allocate(size)) {
        Ok(result) => result,
        // This thread's cache is already torn down (allocation from
        // another destructor during thread exit); serve a single unit
        // straight from the shared tier.
        Err(_) => {
            if size == 0 {
                return None;
            }
            let size = size_class::align(size);
            let mut chain = CentralCache::instance().allocate(size, 1)?;
            unsafe { chain.pop() }
        }
    }
}

/// Returns a block previously obtained from [`allocate`]. No-op when
/// `size` is 0.
///
/// # Safety
///
/// `address` must have been returned by [`allocate`] called with the same
/// `size`, and must not be passed here twice. Debug builds detect double
/// frees and foreign pointers and abort; release builds treat them as
/// undefined behavior, exactly like the system allocator.
pub unsafe fn deallocate(address: NonNull<u8>, size: usize) {
    let result = THREAD_CACHE.try_with(|cache| unsafe {
        cache.borrow_mut().deallocate(address, size)
    });

    // Same situation as in `allocate`: hand the block straight to the
    // shared tier once this thread's cache is gone.
    if result.is_err() && size != 0 {
        let size = size_class::align(size);
        let chain = unsafe { chain::UnitList::single(address) };
        CentralCache::instance().deallocate(chain, size);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{page_cache::PageCache, size_class::ALIGNMENT};

    #[test]
    fn public_surface_round_trip() {
        assert!(allocate(0).is_none());

        let sizes = [1, 8, 100, 4096, 16 * 1024, 100 * 1024];
        let blocks: Vec<_> = sizes
            .iter()
            .map(|&size| {
                let block = allocate(size).unwrap();
                assert_eq!(block.as_ptr() as usize % ALIGNMENT, 0);
                unsafe { block.as_ptr().write_bytes(0x5A, size) };
                (block, size)
            })
            .collect();

        for (block, size) in blocks {
            unsafe {
                for offset in [0, size / 2, size - 1] {
                    assert_eq!(*block.as_ptr().add(offset), 0x5A);
                }
                deallocate(block, size);
            }
        }
    }

    #[test]
    fn reuses_freed_blocks() {
        // Not required by the contract, but the LIFO fast path makes it
        // deterministic within one thread.
        let size = 48;
        let first = allocate(size).unwrap();
        unsafe { deallocate(first, size) };
        let second = allocate(size).unwrap();
        assert_eq!(first, second);
        unsafe { deallocate(second, size) };
    }

    /// Mixed allocate/deallocate traffic from eight threads over an
    /// instance-owned pool; when every thread cache has dropped, the page
    /// cache must be back to its initial coalesced state.
    #[test]
    fn eight_threads_mixed_traffic_leaks_nothing() {
        let pages = PageCache::new();
        let central = CentralCache::new(&pages);

        let threads = 8u64;
        let ops = if cfg!(miri) { 200 } else { 100_000 };

        thread::scope(|scope| {
            for seed in 1..=threads {
                let central = &central;
                scope.spawn(move || {
                    let mut cache = ThreadCache::new(central);
                    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

                    // Small deterministic PRNG, one stream per thread.
                    let mut state: u64 = 0x9E37_79B9_7F4A_7C15u64.wrapping_mul(seed);
                    let mut next = || {
                        state ^= state << 13;
                        state ^= state >> 7;
                        state ^= state << 17;
                        state
                    };

                    for _ in 0..ops {
                        let roll = next() % 10;
                        // 70/30 mix of allocations and deallocations, with
                        // a ceiling on the live set so the test stays
                        // within a sane footprint.
                        if (roll < 7 && live.len() < 8_000) || live.is_empty() {
                            let size = 8 + (next() as usize) % 4089;
                            let block = cache.allocate(size).unwrap();
                            unsafe { block.as_ptr().write(seed as u8) };
                            live.push((block, size));
                        } else {
                            let victim = (next() as usize) % live.len();
                            let (block, size) = live.swap_remove(victim);
                            unsafe {
                                assert_eq!(block.as_ptr().read(), seed as u8);
                                cache.deallocate(block, size);
                            }
                        }
                    }

                    for (block, size) in live {
                        unsafe { cache.deallocate(block, size) };
                    }
                });
            }
        });

        // Every thread cache spilled on drop and every span drained.
        assert!(pages.is_fully_coalesced());
    }
}
