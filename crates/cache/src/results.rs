//! Byte-bounded result list with lazy paging
//!
//! [`BoundedResultStore`] holds an append-ordered list (search hits, for the
//! reader) under a byte budget. When an append would overflow the budget the
//! oldest items are dropped first. Range reads keep page bookkeeping for lazy
//! loading in pages of [`PAGE_SIZE`] items; pages are marked loaded
//! synchronously and a [`StoreEvent::LazyLoadRequested`] tells the owner to
//! fetch the data.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

use crate::entry::{CacheEntry, MemoryFootprint};
use crate::error::EntryError;
use crate::events::EventBus;

/// Items per lazy-loading page
pub const PAGE_SIZE: usize = 100;

/// Share of the budget `optimize` trims down to
pub const OPTIMIZE_TARGET: f64 = 0.8;

/// Default budget for a result store
pub const DEFAULT_MAX_MEMORY: i64 = 50 * 1024 * 1024;

/// A single search match
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub page: u32,
    /// Index of the match within the page text
    pub position: usize,
    pub matched_text: String,
    /// Surrounding text shown in the result list
    pub context: String,
}

impl SearchHit {
    pub fn new(
        page: u32,
        position: usize,
        matched_text: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            page,
            position,
            matched_text: matched_text.into(),
            context: context.into(),
        }
    }
}

impl MemoryFootprint for SearchHit {
    fn memory_footprint(&self) -> i64 {
        (self.matched_text.len() + self.context.len() + std::mem::size_of::<SearchHit>()) as i64
    }
}

/// Events published by a result store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ResultsAdded { count: usize },
    ResultsCleared,
    MemoryOptimized { bytes_freed: i64 },
    /// The owner should load items `start..start + count`
    LazyLoadRequested { start: usize, count: usize },
}

struct StoreState<T> {
    /// Items with their footprint, oldest at the front
    items: VecDeque<(T, i64)>,
    current: i64,
    max: i64,
    lazy: bool,
    loaded_pages: HashSet<usize>,
    enabled: bool,
    hits: i64,
    misses: i64,
}

impl<T> StoreState<T> {
    /// Drop oldest items until `bytes` are freed or the store is empty
    fn evict_oldest(&mut self, bytes: i64) -> i64 {
        let mut freed = 0;
        while freed < bytes {
            let Some((_, size)) = self.items.pop_front() else {
                break;
            };
            freed += size;
        }
        self.current -= freed;
        freed
    }

    /// Mark the pages covering `start..start + count` loaded, returning the
    /// load requests for pages that were not
    ///
    /// A request covers the held items of its page, so the last page reports
    /// only the tail. Pages past the end of the list report a full page.
    fn mark_loaded(&mut self, start: usize, count: usize) -> Vec<StoreEvent> {
        if !self.lazy || count == 0 {
            return Vec::new();
        }
        let len = self.items.len();
        let first = start / PAGE_SIZE;
        let last = (start + count - 1) / PAGE_SIZE;
        (first..=last)
            .filter(|page| self.loaded_pages.insert(*page))
            .map(|page| {
                let start = page * PAGE_SIZE;
                let count = match len.checked_sub(start) {
                    Some(held) if held > 0 => held.min(PAGE_SIZE),
                    _ => PAGE_SIZE,
                };
                StoreEvent::LazyLoadRequested { start, count }
            })
            .collect()
    }
}

/// Append-ordered store bounded by bytes
///
/// # Example
///
/// ```
/// use pdf_reader_cache::{BoundedResultStore, SearchHit};
///
/// let store = BoundedResultStore::new(64 * 1024);
/// store.add(vec![
///     SearchHit::new(1, 10, "cache", "the cache layer"),
///     SearchHit::new(3, 42, "cache", "cache eviction"),
/// ]);
///
/// let first = store.get(0, Some(1));
/// assert_eq!(first[0].page, 1);
/// assert_eq!(store.len(), 2);
/// ```
pub struct BoundedResultStore<T> {
    state: Mutex<StoreState<T>>,
    events: EventBus<StoreEvent>,
}

impl<T: MemoryFootprint + Clone + Send> BoundedResultStore<T> {
    pub fn new(max_memory: i64) -> Self {
        Self {
            state: Mutex::new(StoreState {
                items: VecDeque::new(),
                current: 0,
                max: max_memory.max(0),
                lazy: false,
                loaded_pages: HashSet::new(),
                enabled: true,
                hits: 0,
                misses: 0,
            }),
            events: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus<StoreEvent> {
        &self.events
    }

    /// Append items, first dropping the oldest ones if the batch would
    /// overflow the budget
    ///
    /// A batch larger than the whole budget is still appended in full; call
    /// [`optimize`](Self::optimize) to trim it. A disabled store drops the
    /// batch.
    pub fn add(&self, items: Vec<T>) {
        if items.is_empty() || !self.is_enabled() {
            return;
        }

        let sized: Vec<(T, i64)> = items
            .into_iter()
            .map(|item| {
                let size = item.memory_footprint().max(0);
                (item, size)
            })
            .collect();
        let additional: i64 = sized.iter().map(|(_, size)| size).sum();
        let count = sized.len();

        let freed = {
            let mut state = self.state.lock();
            let overflow = state.current + additional - state.max;
            let freed = if overflow > 0 {
                state.evict_oldest(overflow)
            } else {
                0
            };
            state.current += additional;
            state.items.extend(sized);
            freed
        };

        if freed > 0 {
            tracing::debug!(bytes_freed = freed, "evicted oldest results to fit batch");
            self.events.emit(StoreEvent::MemoryOptimized { bytes_freed: freed });
        }
        self.events.emit(StoreEvent::ResultsAdded { count });
    }

    /// Read `count` items from `start` (all remaining when `None`)
    ///
    /// Out-of-range starts return nothing. With lazy loading on, pages
    /// touched by the read are marked loaded. A disabled store returns
    /// nothing and counts neither a hit nor a miss.
    pub fn get(&self, start: usize, count: Option<usize>) -> Vec<T> {
        let (items, requests) = {
            let mut state = self.state.lock();
            if !state.enabled {
                return Vec::new();
            }
            let len = state.items.len();
            if start >= len {
                state.misses += 1;
                return Vec::new();
            }

            let available = len - start;
            let count = count.map_or(available, |c| c.min(available));
            let requests = state.mark_loaded(start, count);
            let items: Vec<T> = state
                .items
                .iter()
                .skip(start)
                .take(count)
                .map(|(item, _)| item.clone())
                .collect();

            if items.is_empty() {
                state.misses += 1;
            } else {
                state.hits += 1;
            }
            (items, requests)
        };

        for request in requests {
            self.events.emit(request);
        }
        items
    }

    /// Request lazy loading of the pages covering `start..start + count`
    pub fn preload(&self, start: usize, count: usize) {
        let requests = self.state.lock().mark_loaded(start, count);
        for request in requests {
            self.events.emit(request);
        }
    }

    /// Turn lazy paging on or off
    ///
    /// Items already held count as loaded.
    pub fn enable_lazy_loading(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.lazy = enabled;
        if enabled {
            let pages = state.items.len().div_ceil(PAGE_SIZE);
            state.loaded_pages.extend(0..pages);
        }
    }

    pub fn is_lazy_loading_enabled(&self) -> bool {
        self.state.lock().lazy
    }

    /// Whether the page holding item `index` is marked loaded
    pub fn is_page_loaded(&self, index: usize) -> bool {
        self.state.lock().loaded_pages.contains(&(index / PAGE_SIZE))
    }

    /// Remove every item and forget page bookkeeping
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.items.clear();
            state.loaded_pages.clear();
            state.current = 0;
        }
        self.events.emit(StoreEvent::ResultsCleared);
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the footprints of the items held
    pub fn current_memory_usage(&self) -> i64 {
        self.state.lock().current
    }

    pub fn max_memory_usage(&self) -> i64 {
        self.state.lock().max
    }

    /// Change the budget; lowering it below current usage evicts at once
    pub fn set_max_memory(&self, bytes: i64) {
        let freed = {
            let mut state = self.state.lock();
            state.max = bytes.max(0);
            let overflow = state.current - state.max;
            if overflow > 0 {
                state.evict_oldest(overflow)
            } else {
                0
            }
        };
        if freed > 0 {
            self.events.emit(StoreEvent::MemoryOptimized { bytes_freed: freed });
        }
    }

    /// If over budget, evict down to 80% of it. Returns bytes freed.
    pub fn optimize(&self) -> i64 {
        let freed = {
            let mut state = self.state.lock();
            if state.current <= state.max {
                return 0;
            }
            let target = (state.max as f64 * OPTIMIZE_TARGET) as i64;
            let to_free = state.current - target;
            state.evict_oldest(to_free)
        };
        self.events.emit(StoreEvent::MemoryOptimized { bytes_freed: freed });
        freed
    }
}

impl<T: MemoryFootprint + Clone + Send> Default for BoundedResultStore<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MEMORY)
    }
}

impl<T: MemoryFootprint + Clone + Send> CacheEntry for BoundedResultStore<T> {
    fn memory_usage(&self) -> i64 {
        self.current_memory_usage()
    }

    fn max_memory_limit(&self) -> i64 {
        self.max_memory_usage()
    }

    fn set_max_memory_limit(&self, bytes: i64) {
        self.set_max_memory(bytes)
    }

    fn clear(&self) -> Result<(), EntryError> {
        BoundedResultStore::clear(self);
        Ok(())
    }

    fn entry_count(&self) -> i32 {
        i32::try_from(self.len()).unwrap_or(i32::MAX)
    }

    fn evict_lru(&self, bytes_to_free: i64) -> Result<i64, EntryError> {
        if bytes_to_free <= 0 {
            return Ok(0);
        }
        let freed = self.state.lock().evict_oldest(bytes_to_free);
        if freed > 0 {
            self.events.emit(StoreEvent::MemoryOptimized { bytes_freed: freed });
        }
        Ok(freed)
    }

    fn hit_count(&self) -> i64 {
        self.state.lock().hits
    }

    fn miss_count(&self) -> i64 {
        self.state.lock().misses
    }

    fn reset_statistics(&self) {
        let mut state = self.state.lock();
        state.hits = 0;
        state.misses = 0;
    }

    fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[derive(Debug, Clone, PartialEq)]
    struct Item(i64, u32);

    impl MemoryFootprint for Item {
        fn memory_footprint(&self) -> i64 {
            self.0
        }
    }

    fn items(sizes: &[i64]) -> Vec<Item> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &s)| Item(s, i as u32))
            .collect()
    }

    fn held_sum(store: &BoundedResultStore<Item>) -> i64 {
        store.get(0, None).iter().map(|i| i.0).sum()
    }

    #[test]
    fn test_add_tracks_usage() {
        let store = BoundedResultStore::new(1000);
        store.add(items(&[10, 20, 30]));

        assert_eq!(store.len(), 3);
        assert_eq!(store.current_memory_usage(), 60);
    }

    #[test]
    fn test_add_evicts_oldest_first() {
        let store = BoundedResultStore::new(100);
        store.add(items(&[40, 40]));
        store.add(vec![Item(30, 99)]);

        // 80 + 30 overflows by 10; the first item goes
        let held = store.get(0, None);
        assert_eq!(held.len(), 2);
        assert_eq!(held[0], Item(40, 1));
        assert_eq!(held[1], Item(30, 99));
        assert_eq!(store.current_memory_usage(), 70);
    }

    #[test]
    fn test_add_emits_events() {
        let store = BoundedResultStore::new(50);
        let rx = store.events().subscribe();

        store.add(items(&[30]));
        store.add(items(&[30]));

        assert_eq!(rx.try_recv(), Ok(StoreEvent::ResultsAdded { count: 1 }));
        assert_eq!(rx.try_recv(), Ok(StoreEvent::MemoryOptimized { bytes_freed: 30 }));
        assert_eq!(rx.try_recv(), Ok(StoreEvent::ResultsAdded { count: 1 }));
    }

    #[test]
    fn test_oversized_batch_then_optimize() {
        let store = BoundedResultStore::new(100);
        store.add(items(&[50, 50, 50]));
        assert_eq!(store.current_memory_usage(), 150);

        let freed = store.optimize();
        // Down to 80 bytes: two of the three go
        assert_eq!(freed, 100);
        assert_eq!(store.current_memory_usage(), 50);
        assert!(store.current_memory_usage() <= store.max_memory_usage());
    }

    #[test]
    fn test_optimize_within_budget_is_noop() {
        let store = BoundedResultStore::new(100);
        store.add(items(&[10, 10]));
        assert_eq!(store.optimize(), 0);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_set_max_memory_evicts_difference() {
        let store = BoundedResultStore::new(1000);
        store.add(items(&[100; 10]));

        store.set_max_memory(550);
        assert_eq!(store.current_memory_usage(), 500);
        assert_eq!(store.len(), 5);

        store.set_max_memory(5000);
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_get_ranges() {
        let store = BoundedResultStore::new(10_000);
        store.add(items(&[1; 10]));

        assert_eq!(store.get(8, Some(5)).len(), 2);
        assert_eq!(store.get(2, Some(3)).iter().map(|i| i.1).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert!(store.get(10, None).is_empty());
        assert!(store.get(99, Some(1)).is_empty());

        assert_eq!(store.hit_count(), 2);
        assert_eq!(store.miss_count(), 2);
    }

    #[test]
    fn test_lazy_loading_marks_pages() {
        let store = BoundedResultStore::new(1_000_000);
        store.enable_lazy_loading(true);
        store.add(items(&[1; 250]));
        let rx = store.events().subscribe();

        assert!(!store.is_page_loaded(150));
        let read = store.get(150, Some(100));
        assert_eq!(read.len(), 100);

        assert_eq!(
            rx.try_recv(),
            Ok(StoreEvent::LazyLoadRequested { start: 100, count: PAGE_SIZE })
        );
        assert_eq!(
            rx.try_recv(),
            Ok(StoreEvent::LazyLoadRequested { start: 200, count: 50 })
        );
        assert!(store.is_page_loaded(150));
        assert!(store.is_page_loaded(249));

        // Already loaded pages are not requested again
        store.get(150, Some(10));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_preload_past_the_end_requests_full_page() {
        let store = BoundedResultStore::new(1_000_000);
        store.enable_lazy_loading(true);
        store.add(items(&[1; 30]));
        let rx = store.events().subscribe();

        store.preload(100, 1);
        assert_eq!(
            rx.try_recv(),
            Ok(StoreEvent::LazyLoadRequested { start: 100, count: PAGE_SIZE })
        );
    }

    #[test]
    fn test_disabled_store_ignores_traffic() {
        let store = BoundedResultStore::new(1000);
        store.add(items(&[10, 20]));
        let rx = store.events().subscribe();

        store.set_enabled(false);
        store.add(items(&[30]));
        assert_eq!(store.len(), 2);
        assert_eq!(store.current_memory_usage(), 30);
        assert!(store.get(0, None).is_empty());
        assert_eq!(store.hit_count(), 0);
        assert_eq!(store.miss_count(), 0);
        assert!(rx.try_recv().is_err());

        store.set_enabled(true);
        assert_eq!(store.get(0, None).len(), 2);
        assert_eq!(store.hit_count(), 1);
    }

    #[test]
    fn test_enable_lazy_loading_marks_existing_pages() {
        let store = BoundedResultStore::new(1_000_000);
        store.add(items(&[1; 150]));
        store.enable_lazy_loading(true);

        assert!(store.is_page_loaded(0));
        assert!(store.is_page_loaded(149));
        assert!(!store.is_page_loaded(200));
    }

    #[test]
    fn test_preload_without_lazy_loading_is_noop() {
        let store: BoundedResultStore<Item> = BoundedResultStore::new(1000);
        let rx = store.events().subscribe();
        store.preload(0, 500);
        assert!(rx.try_recv().is_err());
        assert!(!store.is_page_loaded(0));
    }

    #[test]
    fn test_clear() {
        let store = BoundedResultStore::new(1000);
        store.enable_lazy_loading(true);
        store.add(items(&[5; 20]));
        store.get(0, Some(5));
        let rx = store.events().subscribe();

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.current_memory_usage(), 0);
        assert!(!store.is_page_loaded(0));
        assert_eq!(rx.try_recv(), Ok(StoreEvent::ResultsCleared));
    }

    #[test]
    fn test_cache_entry_evicts_oldest() {
        let store = BoundedResultStore::new(1000);
        store.add(items(&[100, 200, 300]));

        let freed = store.evict_lru(150).unwrap();
        assert_eq!(freed, 300);
        assert_eq!(store.get(0, None), vec![Item(300, 2)]);
        assert_eq!(store.entry_count(), 1);
    }

    #[test]
    fn test_search_hit_footprint() {
        let hit = SearchHit::new(1, 0, "abc", "xx abc yy");
        assert_eq!(
            hit.memory_footprint(),
            (3 + 9 + std::mem::size_of::<SearchHit>()) as i64
        );
    }

    #[test]
    fn test_usage_matches_held_items_under_random_operations() {
        let mut rng = rand::thread_rng();
        let store = BoundedResultStore::new(2_000);

        for _ in 0..500 {
            match rng.gen_range(0..5) {
                0 | 1 => {
                    let n = rng.gen_range(1..8);
                    let batch: Vec<i64> = (0..n).map(|_| rng.gen_range(1..300)).collect();
                    store.add(items(&batch));
                }
                2 => {
                    store.evict_lru(rng.gen_range(0..800)).unwrap();
                }
                3 => {
                    store.set_max_memory(rng.gen_range(500..3_000));
                }
                _ => {
                    store.optimize();
                    assert!(store.current_memory_usage() <= store.max_memory_usage());
                }
            }

            assert!(store.current_memory_usage() >= 0);
            assert_eq!(store.current_memory_usage(), held_sum(&store));
        }
    }
}
