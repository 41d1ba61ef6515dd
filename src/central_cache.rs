use std::{collections::BTreeMap, ptr::NonNull, sync::OnceLock};

use crate::{
    chain::UnitList,
    page_cache::PageCache,
    page_span::{PageSpan, MAX_UNITS_PER_SPAN},
    size_class::{self, ALIGNMENT, MAX_CACHED_UNIT_SIZE, NUM_SIZE_CLASSES, PAGE_SIZE},
    span::MemorySpan,
    spin::SpinLock,
};

/// Per-size-class state. Everything in here is guarded by the class
/// spinlock in [`CentralCache::classes`].
struct ClassState {
    /// Carved units of this class that no thread cache currently holds.
    free_units: UnitList,
    /// Page spans carved for this class, keyed by base address. A unit
    /// pointer finds its owning span with a predecessor lookup.
    spans: BTreeMap<usize, PageSpan>,
    /// How many list-cap groups of pages to fetch on the next refill.
    /// Grows by one per refill and halves whenever a span of this class
    /// goes back to the page cache.
    #[cfg(not(debug_assertions))]
    next_group: usize,
}

impl ClassState {
    fn new() -> Self {
        Self {
            free_units: UnitList::new(),
            spans: BTreeMap::new(),
            #[cfg(not(debug_assertions))]
            next_group: 0,
        }
    }
}

/// Middle tier of the pool. Receives page runs from the page cache,
/// carves them into fixed-size units, and moves units to and from thread
/// caches in batches. Each size class has its own spinlock, so threads
/// allocating different sizes never contend here.
///
/// Lock order is strictly class spinlock, then page cache mutex. A thread
/// never holds two class locks at once.
pub(crate) struct CentralCache<'a> {
    classes: Vec<SpinLock<ClassState>>,
    pages: &'a PageCache,
}

static CENTRAL_CACHE: OnceLock<CentralCache<'static>> = OnceLock::new();

impl CentralCache<'static> {
    /// Process-wide instance backed by [`PageCache::instance`].
    pub fn instance() -> &'static CentralCache<'static> {
        CENTRAL_CACHE.get_or_init(|| CentralCache::new(PageCache::instance()))
    }
}

impl<'a> CentralCache<'a> {
    pub fn new(pages: &'a PageCache) -> Self {
        Self {
            classes: (0..NUM_SIZE_CLASSES)
                .map(|_| SpinLock::new(ClassState::new()))
                .collect(),
            pages,
        }
    }

    /// Hands out a chain of `count` units of `unit_size` bytes each.
    /// `unit_size` must be word aligned; oversize requests are routed
    /// straight to the page cache's unit path. Returns `None` only when
    /// the kernel refuses memory, in which case no cache state changed.
    pub fn allocate(&self, unit_size: usize, count: usize) -> Option<UnitList> {
        debug_assert_eq!(unit_size % ALIGNMENT, 0);
        debug_assert!(count >= 1 && count <= MAX_UNITS_PER_SPAN);

        if unit_size == 0 || count == 0 {
            return None;
        }

        if unit_size > MAX_CACHED_UNIT_SIZE {
            let span = self.pages.allocate_unit(unit_size)?;
            return Some(unsafe { UnitList::single(span.data()) });
        }

        let index = size_class::class_index(unit_size);
        let mut class = self.classes[index].lock();

        let chain = if class.free_units.len() < count {
            self.refill_from_pages(&mut class, unit_size, count)?
        } else {
            let mut chain = UnitList::new();
            for _ in 0..count {
                let unit = unsafe { class.free_units.pop() }.unwrap();
                Self::record_allocated(&mut class.spans, unit, unit_size);
                unsafe { chain.push(unit) };
            }
            chain
        };

        debug_assert_eq!(chain.len(), count);
        debug_assert_eq!(unsafe { chain.iter().count() }, count);

        Some(chain)
    }

    /// Takes back a chain of units of `unit_size` bytes each. Every unit
    /// goes on the class free list and is marked returned in its owning
    /// span; a span whose last unit comes back is excised from the free
    /// list and its pages go back to the page cache.
    pub fn deallocate(&self, chain: UnitList, unit_size: usize) {
        debug_assert_eq!(unit_size % ALIGNMENT, 0);

        if chain.is_empty() {
            return;
        }

        if unit_size > MAX_CACHED_UNIT_SIZE {
            debug_assert_eq!(chain.len(), 1);
            let mut chain = chain;
            if let Some(unit) = unsafe { chain.pop() } {
                self.pages.deallocate_unit(MemorySpan::new(unit, unit_size));
            }
            return;
        }

        let index = size_class::class_index(unit_size);
        let mut class = self.classes[index].lock();

        let mut chain = chain;
        while let Some(unit) = unsafe { chain.pop() } {
            let unit_span = MemorySpan::new(unit, unit_size);
            unsafe { class.free_units.push(unit) };

            let address = unit.as_ptr() as usize;
            let emptied = {
                let (&base, span) = class.spans.range_mut(..=address).next_back().unwrap();
                debug_assert!(span.contains_unit(unit_span));
                span.deallocate(unit_span);
                span.is_empty().then_some(base)
            };

            if let Some(base) = emptied {
                let span = class.spans.remove(&base).unwrap();
                let memory = span.memory();

                // The span's units leave with the span.
                let removed =
                    unsafe { class.free_units.remove_in_range(memory.addr(), memory.end_addr()) };
                debug_assert!(removed > 0);

                #[cfg(not(debug_assertions))]
                {
                    class.next_group /= 2;
                }

                self.pages.deallocate_page(memory);
            }
        }
    }

    /// Fetches a fresh page run, carves `count` units into the result
    /// chain and parks the surplus on the class free list.
    fn refill_from_pages(
        &self,
        class: &mut ClassState,
        unit_size: usize,
        count: usize,
    ) -> Option<UnitList> {
        let page_count = Self::pages_for(class, unit_size);
        let memory = self.pages.allocate_page(page_count)?;
        let mut span = PageSpan::new(memory, unit_size);

        #[cfg(debug_assertions)]
        let carve_count = MAX_UNITS_PER_SPAN;
        #[cfg(not(debug_assertions))]
        let carve_count = memory.len() / unit_size;
        debug_assert!(carve_count >= count);

        let mut chain = UnitList::new();
        let mut rest = memory;
        for _ in 0..count {
            let (unit, tail) = rest.split_at(unit_size);
            span.allocate(unit);
            unsafe { chain.push(unit.data()) };
            rest = tail;
        }
        for _ in 0..carve_count - count {
            let (unit, tail) = rest.split_at(unit_size);
            unsafe { class.free_units.push(unit.data()) };
            rest = tail;
        }

        class.spans.insert(memory.addr(), span);

        Some(chain)
    }

    /// How many pages to fetch for a refill of `unit_size` units.
    ///
    /// Debug builds fetch exactly enough to carve
    /// [`MAX_UNITS_PER_SPAN`] units, the most the bitmap accounting can
    /// track. Release builds fetch a growing number of list-cap groups so
    /// that hot classes amortize page cache trips, damped again in
    /// [`CentralCache::deallocate`] once spans start coming back.
    #[cfg(debug_assertions)]
    fn pages_for(_class: &mut ClassState, unit_size: usize) -> usize {
        size_class::align_to(unit_size * MAX_UNITS_PER_SPAN, PAGE_SIZE) / PAGE_SIZE
    }

    #[cfg(not(debug_assertions))]
    fn pages_for(class: &mut ClassState, _unit_size: usize) -> usize {
        let groups = class.next_group.max(1);
        class.next_group = groups + 1;

        let bytes = groups * crate::thread_cache::MAX_FREE_BYTES_PER_LIST;
        size_class::align_to(bytes, PAGE_SIZE) / PAGE_SIZE
    }

    /// Marks a unit served from the class free list as outstanding in its
    /// owning span.
    fn record_allocated(
        spans: &mut BTreeMap<usize, PageSpan>,
        unit: NonNull<u8>,
        unit_size: usize,
    ) {
        let address = unit.as_ptr() as usize;
        let (_, span) = spans.range_mut(..=address).next_back().unwrap();
        span.allocate(MemorySpan::new(unit, unit_size));
    }

    /// Only used for testing.
    #[cfg(test)]
    pub fn free_unit_count(&self, unit_size: usize) -> usize {
        self.classes[size_class::class_index(unit_size)]
            .lock()
            .free_units
            .len()
    }

    #[cfg(test)]
    pub fn span_count(&self, unit_size: usize) -> usize {
        self.classes[size_class::class_index(unit_size)].lock().spans.len()
    }

    #[cfg(test)]
    pub fn total_span_count(&self) -> usize {
        self.classes.iter().map(|class| class.lock().spans.len()).sum()
    }

    #[cfg(test)]
    pub fn outstanding_units(&self, unit_size: usize) -> usize {
        self.classes[size_class::class_index(unit_size)]
            .lock()
            .spans
            .values()
            .map(PageSpan::outstanding_units)
            .sum()
    }
}
