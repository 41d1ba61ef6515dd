use std::{
    alloc::{self, Layout},
    collections::{BTreeMap, BTreeSet},
    ptr::{self, NonNull},
    sync::{Mutex, OnceLock},
};

use crate::{
    platform,
    size_class::{ALIGNMENT, PAGE_SIZE},
    span::MemorySpan,
};

/// Minimum number of pages requested from the kernel per mapping, about
/// 8 MiB. Fetching in bulk keeps the mapping count low; whatever the
/// caller didn't ask for goes straight into the free-span index.
pub(crate) const BULK_PAGE_REQUEST: usize = 2048;

/// Free-span indexes plus the mapping list for teardown. Lives behind the
/// [`PageCache`] mutex.
struct PageStore {
    /// Page count of a span to the set of free spans with that length.
    by_length: BTreeMap<usize, BTreeSet<MemorySpan>>,
    /// Base address of a free span to the span, for coalescing.
    by_addr: BTreeMap<usize, MemorySpan>,
    /// Every mapping ever obtained from the kernel, kept until teardown.
    mappings: Vec<MemorySpan>,
    stopped: bool,
}

impl PageStore {
    /// Inserts a free span into both indexes.
    fn index_span(&mut self, span: MemorySpan) {
        debug_assert_eq!(span.len() % PAGE_SIZE, 0);
        self.by_length
            .entry(span.len() / PAGE_SIZE)
            .or_default()
            .insert(span);
        self.by_addr.insert(span.addr(), span);
    }

    /// Removes a free span from both indexes. Empty length buckets are
    /// dropped so that lower-bound searches never have to skip them.
    fn unindex_span(&mut self, span: MemorySpan) {
        let pages = span.len() / PAGE_SIZE;
        let spans = self.by_length.get_mut(&pages).unwrap();
        spans.remove(&span);
        if spans.is_empty() {
            self.by_length.remove(&pages);
        }
        self.by_addr.remove(&span.addr());
    }

    /// Takes the first indexed span holding at least `page_count` pages.
    fn take_free_span(&mut self, page_count: usize) -> Option<MemorySpan> {
        let (_, spans) = self.by_length.range(page_count..).next()?;
        let span = *spans.iter().next().unwrap();
        self.unindex_span(span);

        Some(span)
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for mapping in &self.mappings {
            unsafe { platform::return_memory(mapping.data(), mapping.len()) };
        }
    }
}

/// Bottom tier of the pool. Hands out runs of contiguous pages to the
/// central cache, indexes returned runs and coalesces adjacent ones, and
/// owns every mapping obtained from the kernel until teardown. Oversize
/// allocations bypass the page machinery entirely and go to the system
/// allocator through [`PageCache::allocate_unit`].
///
/// All state sits behind one mutex. The central cache calls in here while
/// holding a size-class spinlock; this cache never calls back up, so that
/// lock order can't deadlock.
pub(crate) struct PageCache {
    store: Mutex<PageStore>,
}

static PAGE_CACHE: OnceLock<PageCache> = OnceLock::new();

impl PageCache {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(PageStore {
                by_length: BTreeMap::new(),
                by_addr: BTreeMap::new(),
                mappings: Vec::new(),
                stopped: false,
            }),
        }
    }

    /// Process-wide instance, created on first use and kept until process
    /// exit. Teardown is the kernel's job at that point; instance-owned
    /// caches (tests) unmap through `Drop` instead.
    pub fn instance() -> &'static PageCache {
        PAGE_CACHE.get_or_init(PageCache::new)
    }

    /// Hands out a span of exactly `page_count` contiguous pages, zeroed
    /// on first use. Returns `None` if `page_count` is 0 or the kernel
    /// refuses a mapping; no state changes in that case.
    pub fn allocate_page(&self, page_count: usize) -> Option<MemorySpan> {
        if page_count == 0 {
            return None;
        }

        let mut store = self.store.lock().ok()?;

        let span = match store.take_free_span(page_count) {
            Some(span) => span,
            None => {
                let length = page_count.max(BULK_PAGE_REQUEST) * PAGE_SIZE;
                let mapping = Self::system_allocate(length)?;
                store.mappings.push(mapping);
                mapping
            }
        };

        let (result, rest) = span.split_at(page_count * PAGE_SIZE);
        if rest.len() > 0 {
            store.index_span(rest);
        }

        Some(result)
    }

    /// Takes back a span of whole pages, merging it with any adjacent free
    /// spans before indexing so the index always holds maximal spans.
    pub fn deallocate_page(&self, span: MemorySpan) {
        debug_assert_eq!(span.len() % PAGE_SIZE, 0);

        let Ok(mut store) = self.store.lock() else {
            return;
        };
        debug_assert!(!store.by_addr.contains_key(&span.addr()));

        let mut span = span;

        // Coalesce left: the closest free span below us, as long as it
        // ends exactly where we start.
        loop {
            let Some((_, &previous)) = store.by_addr.range(..span.addr()).next_back() else {
                break;
            };
            if previous.end_addr() != span.addr() {
                break;
            }
            store.unindex_span(previous);
            span = MemorySpan::new(previous.data(), previous.len() + span.len());
        }

        // Coalesce right: a free span starting exactly where we end.
        loop {
            let Some(&next) = store.by_addr.get(&span.end_addr()) else {
                break;
            };
            store.unindex_span(next);
            span = MemorySpan::new(span.data(), span.len() + next.len());
        }

        store.index_span(span);
    }

    /// Oversize path: a single block straight from the system allocator,
    /// no page span accounting, no caching.
    pub fn allocate_unit(&self, size: usize) -> Option<MemorySpan> {
        let layout = Layout::from_size_align(size, ALIGNMENT).ok()?;
        let address = NonNull::new(unsafe { alloc::alloc(layout) })?;

        Some(MemorySpan::new(address, size))
    }

    /// Returns an oversize block to the system allocator.
    pub fn deallocate_unit(&self, span: MemorySpan) {
        let Ok(layout) = Layout::from_size_align(span.len(), ALIGNMENT) else {
            return;
        };
        unsafe { alloc::dealloc(span.data().as_ptr(), layout) };
    }

    /// Unmaps every mapping ever obtained. Idempotent; teardown may race
    /// with threads that are already past their last deallocation.
    pub fn stop(&self) {
        let Ok(mut store) = self.store.lock() else {
            return;
        };
        store.stop();
    }

    fn system_allocate(length: usize) -> Option<MemorySpan> {
        let address = unsafe { platform::request_memory(length)? };
        unsafe { ptr::write_bytes(address.as_ptr(), 0, length) };

        Some(MemorySpan::new(address, length))
    }

    /// Only used for testing, see also the accessors below.
    #[cfg(test)]
    fn with_store<R>(&self, inspect: impl FnOnce(&PageStore) -> R) -> R {
        inspect(&self.store.lock().unwrap())
    }

    #[cfg(test)]
    pub fn free_span_count(&self) -> usize {
        self.with_store(|store| store.by_addr.len())
    }

    #[cfg(test)]
    pub fn free_page_total(&self) -> usize {
        self.with_store(|store| store.by_addr.values().map(|span| span.len() / PAGE_SIZE).sum())
    }

    #[cfg(test)]
    pub fn mapping_count(&self) -> usize {
        self.with_store(|store| store.mappings.len())
    }

    /// Whether every mapping's full extent is again covered by a single
    /// indexed free span, i.e. everything handed out has come back and
    /// coalesced. Two separate mappings that happen to be adjacent may
    /// have merged into one span, which still counts as coalesced.
    #[cfg(test)]
    pub fn is_fully_coalesced(&self) -> bool {
        self.with_store(|store| {
            store.mappings.iter().all(|mapping| {
                store
                    .by_addr
                    .range(..=mapping.addr())
                    .next_back()
                    .is_some_and(|(_, span)| {
                        span.addr() <= mapping.addr() && span.end_addr() >= mapping.end_addr()
                    })
            })
        })
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        self.stop();
    }
}
