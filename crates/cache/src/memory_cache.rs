//! Byte-bounded in-memory cache with LRU eviction
//!
//! [`MemoryCache`] is the general-purpose cache the reader's subsystems build
//! on. It implements [`CacheEntry`] so it can be registered with the
//! [`CacheRegistry`](crate::CacheRegistry). By default victims are chosen in
//! least-recently-used order; attaching an [`EvictionPolicy`] defers the choice
//! to the policy's active strategy.
//!
//! [`PageTextCache`] specialises it for extracted page text.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

use crate::entry::{CacheEntry, MemoryFootprint};
use crate::error::EntryError;
use crate::policy::EvictionPolicy;
use crate::types::CacheKind;

struct Slot<V> {
    value: V,
    size: i64,
}

struct CacheState<K, V> {
    entries: HashMap<K, Slot<V>>,

    /// LRU queue (most recently used at back, least recently used at front)
    lru_queue: VecDeque<K>,

    memory_used: i64,
    memory_limit: i64,

    /// 0 means unbounded
    max_entries: usize,

    enabled: bool,
    hits: i64,
    misses: i64,
    evictions: u64,
}

impl<K: Eq + Hash + Clone, V> CacheState<K, V> {
    fn new(memory_limit: i64) -> Self {
        Self {
            entries: HashMap::new(),
            lru_queue: VecDeque::new(),
            memory_used: 0,
            memory_limit: memory_limit.max(0),
            max_entries: 0,
            enabled: true,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Move a key to the back of the LRU queue (mark as most recently used)
    fn touch(&mut self, key: &K) {
        self.lru_queue.retain(|k| k != key);
        self.lru_queue.push_back(key.clone());
    }

    fn remove(&mut self, key: &K) -> Option<Slot<V>> {
        let slot = self.entries.remove(key)?;
        self.memory_used = (self.memory_used - slot.size).max(0);
        self.lru_queue.retain(|k| k != key);
        Some(slot)
    }

    /// Whether inserting one more entry of `incoming` bytes breaks a bound
    fn over_budget(&self, incoming: i64) -> bool {
        self.memory_used + incoming > self.memory_limit
            || (self.max_entries > 0 && self.entries.len() >= self.max_entries)
    }
}

/// Thread-safe byte-bounded cache
///
/// # Example
///
/// ```
/// use pdf_reader_cache::{CacheEntry, MemoryCache};
///
/// // 1 KB budget
/// let cache: MemoryCache<u32, String> = MemoryCache::new(1024);
///
/// cache.put(1, "first page".to_string());
/// assert_eq!(cache.get(&1).as_deref(), Some("first page"));
///
/// // Registry-facing view of the same cache
/// assert_eq!(cache.entry_count(), 1);
/// assert_eq!(cache.hit_count(), 1);
/// ```
pub struct MemoryCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    policy: Option<(Arc<EvictionPolicy>, CacheKind)>,
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Display + Send,
    V: MemoryFootprint + Clone + Send,
{
    /// Create a cache with a byte limit
    pub fn new(memory_limit: i64) -> Self {
        Self {
            state: Mutex::new(CacheState::new(memory_limit)),
            policy: None,
        }
    }

    /// Create a cache with a memory limit in megabytes
    pub fn with_mb_limit(megabytes: i64) -> Self {
        Self::new(megabytes * 1024 * 1024)
    }

    /// Also bound the number of entries
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.state.get_mut().max_entries = max_entries;
        self
    }

    /// Report accesses to `policy` and let it rank eviction victims
    ///
    /// Item ids come from [`CacheKind::item_id`], the same ids the registry
    /// records for `notify_*` calls on `kind`.
    pub fn with_policy(mut self, policy: Arc<EvictionPolicy>, kind: CacheKind) -> Self {
        self.policy = Some((policy, kind));
        self
    }

    /// Tell the policy that `keys` left the cache without being evicted
    fn forget(&self, keys: &[K]) {
        if let Some((policy, kind)) = &self.policy {
            for key in keys {
                policy.forget(&kind.item_id(key));
            }
        }
    }

    /// Store a value, evicting as needed to make room
    ///
    /// Returns `false` if the cache is disabled or the value alone exceeds the
    /// byte limit.
    pub fn put(&self, key: K, value: V) -> bool {
        let size = value.memory_footprint().max(0);
        let mut state = self.state.lock();

        if !state.enabled || size > state.memory_limit {
            return false;
        }

        // Replacing an entry frees its old footprint first
        state.remove(&key);

        if state.over_budget(size) {
            let needed = (state.memory_used + size - state.memory_limit).max(0);
            self.evict_locked(&mut state, needed, true);
            while state.over_budget(size) && self.evict_one_locked(&mut state) {}
        }

        state.memory_used += size;
        state.entries.insert(key.clone(), Slot { value, size });
        state.touch(&key);
        drop(state);

        if let Some((policy, kind)) = &self.policy {
            policy.record_access(&kind.item_id(&key));
        }
        true
    }

    /// Look up a value, updating LRU order and hit/miss counters
    pub fn get(&self, key: &K) -> Option<V> {
        let value = {
            let mut state = self.state.lock();
            if !state.enabled {
                return None;
            }
            match state.entries.get(key).map(|slot| slot.value.clone()) {
                Some(value) => {
                    state.touch(key);
                    state.hits += 1;
                    Some(value)
                }
                None => {
                    state.misses += 1;
                    None
                }
            }
        };

        if let Some((policy, kind)) = &self.policy {
            policy.record_access(&kind.item_id(key));
        }
        value
    }

    /// Check for a key without touching LRU order or counters
    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let slot = self.state.lock().remove(key)?;
        self.forget(std::slice::from_ref(key));
        Some(slot.value)
    }

    /// Remove every entry whose key matches `predicate`. Returns the count.
    pub fn remove_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let doomed: Vec<K> = {
            let mut state = self.state.lock();
            let doomed: Vec<K> = state.entries.keys().filter(|k| predicate(k)).cloned().collect();
            for key in &doomed {
                state.remove(key);
            }
            doomed
        };
        self.forget(&doomed);
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries evicted since creation
    pub fn eviction_count(&self) -> u64 {
        self.state.lock().evictions
    }

    /// Evict the least recently used entry. Returns false when empty.
    fn evict_one_locked(&self, state: &mut CacheState<K, V>) -> bool {
        let Some(key) = state.lru_queue.front().cloned() else {
            return false;
        };
        self.evict_key_locked(state, &key);
        true
    }

    fn evict_key_locked(&self, state: &mut CacheState<K, V>, key: &K) -> i64 {
        match state.remove(key) {
            Some(slot) => {
                state.evictions += 1;
                if let Some((policy, kind)) = &self.policy {
                    policy.record_eviction(&kind.item_id(key));
                }
                slot.size
            }
            None => 0,
        }
    }

    /// Free at least `bytes` (or everything). Returns bytes freed.
    ///
    /// Evictions made while `making_room` for an insert always follow LRU
    /// order, even with a policy attached. Otherwise the policy ranks every
    /// entry and victims are taken from the front of its order; only those
    /// are reported evicted.
    fn evict_locked(&self, state: &mut CacheState<K, V>, bytes: i64, making_room: bool) -> i64 {
        if bytes <= 0 {
            return 0;
        }

        let mut freed = 0;
        match &self.policy {
            Some((policy, kind)) if !making_room => {
                let keys: Vec<K> = state.lru_queue.iter().cloned().collect();
                let ids: Vec<String> = keys.iter().map(|k| kind.item_id(k)).collect();
                let ranked = policy.rank_for_eviction(&ids);
                let by_id: HashMap<String, K> = ids.into_iter().zip(keys).collect();
                for id in ranked {
                    if freed >= bytes {
                        break;
                    }
                    if let Some(key) = by_id.get(&id) {
                        freed += self.evict_key_locked(state, key);
                    }
                }
            }
            _ => {
                while freed < bytes {
                    let Some(key) = state.lru_queue.front().cloned() else {
                        break;
                    };
                    freed += self.evict_key_locked(state, &key);
                }
            }
        }
        freed
    }
}

impl<K, V> CacheEntry for MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Display + Send,
    V: MemoryFootprint + Clone + Send,
{
    fn memory_usage(&self) -> i64 {
        self.state.lock().memory_used
    }

    fn max_memory_limit(&self) -> i64 {
        self.state.lock().memory_limit
    }

    fn set_max_memory_limit(&self, bytes: i64) {
        let mut state = self.state.lock();
        state.memory_limit = bytes.max(0);
        let overflow = state.memory_used - state.memory_limit;
        if overflow > 0 {
            self.evict_locked(&mut state, overflow, false);
        }
    }

    fn clear(&self) -> Result<(), EntryError> {
        let keys: Vec<K> = {
            let mut state = self.state.lock();
            state.entries.clear();
            state.memory_used = 0;
            state.lru_queue.drain(..).collect()
        };
        self.forget(&keys);
        Ok(())
    }

    fn entry_count(&self) -> i32 {
        i32::try_from(self.state.lock().entries.len()).unwrap_or(i32::MAX)
    }

    fn evict_lru(&self, bytes_to_free: i64) -> Result<i64, EntryError> {
        let mut state = self.state.lock();
        Ok(self.evict_locked(&mut state, bytes_to_free, false))
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

/// Key of a page in a document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub document_id: String,
    pub page: u32,
}

impl Display for PageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.document_id, self.page)
    }
}

/// Extracted text of a single page
#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub text: String,
}

impl MemoryFootprint for PageText {
    fn memory_footprint(&self) -> i64 {
        (self.text.len() + std::mem::size_of::<PageText>() + std::mem::size_of::<PageKey>()) as i64
    }
}

/// Cache of extracted page text keyed by document and page number
pub struct PageTextCache {
    inner: MemoryCache<PageKey, PageText>,
}

impl PageTextCache {
    pub fn new(memory_limit: i64) -> Self {
        Self {
            inner: MemoryCache::new(memory_limit),
        }
    }

    pub fn with_policy(self, policy: Arc<EvictionPolicy>) -> Self {
        Self {
            inner: self.inner.with_policy(policy, CacheKind::PageText),
        }
    }

    fn key(document_id: &str, page: u32) -> PageKey {
        PageKey {
            document_id: document_id.to_string(),
            page,
        }
    }

    pub fn put(&self, document_id: &str, page: u32, text: impl Into<String>) -> bool {
        self.inner
            .put(Self::key(document_id, page), PageText { text: text.into() })
    }

    pub fn get(&self, document_id: &str, page: u32) -> Option<String> {
        self.inner.get(&Self::key(document_id, page)).map(|t| t.text)
    }

    pub fn contains(&self, document_id: &str, page: u32) -> bool {
        self.inner.contains(&Self::key(document_id, page))
    }

    pub fn invalidate_page(&self, document_id: &str, page: u32) -> bool {
        self.inner.remove(&Self::key(document_id, page)).is_some()
    }

    /// Drop every page of a document. Returns the number of pages removed.
    pub fn invalidate_document(&self, document_id: &str) -> usize {
        self.inner.remove_where(|k| k.document_id == document_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl CacheEntry for PageTextCache {
    fn memory_usage(&self) -> i64 {
        self.inner.memory_usage()
    }

    fn max_memory_limit(&self) -> i64 {
        self.inner.max_memory_limit()
    }

    fn set_max_memory_limit(&self, bytes: i64) {
        self.inner.set_max_memory_limit(bytes)
    }

    fn clear(&self) -> Result<(), EntryError> {
        self.inner.clear()
    }

    fn entry_count(&self) -> i32 {
        self.inner.entry_count()
    }

    fn evict_lru(&self, bytes_to_free: i64) -> Result<i64, EntryError> {
        self.inner.evict_lru(bytes_to_free)
    }

    fn hit_count(&self) -> i64 {
        self.inner.hit_count()
    }

    fn miss_count(&self) -> i64 {
        self.inner.miss_count()
    }

    fn reset_statistics(&self) {
        self.inner.reset_statistics()
    }

    fn set_enabled(&self, enabled: bool) {
        self.inner.set_enabled(enabled)
    }

    fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::EvictionStrategy;

    /// Value with an exact, caller-chosen footprint
    #[derive(Debug, Clone, PartialEq)]
    struct Blob(i64);

    impl MemoryFootprint for Blob {
        fn memory_footprint(&self) -> i64 {
            self.0
        }
    }

    #[test]
    fn test_basic_put_get() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(1000);
        assert!(cache.put(1, Blob(100)));

        assert_eq!(cache.get(&1), Some(Blob(100)));
        assert_eq!(cache.memory_usage(), 100);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_cache_miss() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(1000);
        assert!(cache.get(&999).is_none());

        let stats = cache.stats();
        assert_eq!(stats.total_misses, 1);
        assert_eq!(stats.total_hits, 0);
        assert_eq!(stats.hit_ratio, 0.0);
    }

    #[test]
    fn test_lru_eviction_on_put() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(250);
        cache.put(1, Blob(100));
        cache.put(2, Blob(100));
        cache.put(3, Blob(100)); // Should evict 1

        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
        assert!(cache.contains(&3));
        assert_eq!(cache.eviction_count(), 1);
        assert_eq!(cache.memory_usage(), 200);
    }

    #[test]
    fn test_lru_ordering() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(200);
        cache.put(1, Blob(100));
        cache.put(2, Blob(100));

        // Access 1 to make it more recently used
        assert!(cache.get(&1).is_some());

        cache.put(3, Blob(100));
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
    }

    #[test]
    fn test_oversized_value_rejected() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(100);
        assert!(!cache.put(1, Blob(101)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_existing_entry() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(1000);
        cache.put(1, Blob(100));
        cache.put(1, Blob(300));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_usage(), 300);
    }

    #[test]
    fn test_max_entries() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(10_000).with_max_entries(2);
        cache.put(1, Blob(1));
        cache.put(2, Blob(1));
        cache.put(3, Blob(1));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&1));
    }

    #[test]
    fn test_evict_lru_frees_at_least_requested() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(10_000);
        for i in 0..10 {
            cache.put(i, Blob(100));
        }

        let freed = cache.evict_lru(250).unwrap();
        assert_eq!(freed, 300);
        assert_eq!(cache.memory_usage(), 700);
        // Oldest three went first
        assert!(!cache.contains(&0));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
    }

    #[test]
    fn test_evict_lru_more_than_held() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(10_000);
        cache.put(1, Blob(100));

        assert_eq!(cache.evict_lru(5_000).unwrap(), 100);
        assert_eq!(cache.memory_usage(), 0);
        assert_eq!(cache.evict_lru(-5).unwrap(), 0);
    }

    #[test]
    fn test_set_max_memory_limit_evicts() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(1000);
        for i in 0..10 {
            cache.put(i, Blob(100));
        }

        cache.set_max_memory_limit(450);
        assert_eq!(cache.max_memory_limit(), 450);
        assert!(cache.memory_usage() <= 450);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_disabled_cache_ignores_traffic() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(1000);
        cache.put(1, Blob(10));
        cache.set_enabled(false);

        assert!(!cache.is_enabled());
        assert!(!cache.put(2, Blob(10)));
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.miss_count(), 0);

        cache.set_enabled(true);
        assert!(cache.get(&1).is_some());
    }

    #[test]
    fn test_reset_statistics() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(1000);
        cache.put(1, Blob(10));
        cache.get(&1);
        cache.get(&2);

        cache.reset_statistics();
        assert_eq!(cache.hit_count(), 0);
        assert_eq!(cache.miss_count(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear() {
        let cache: MemoryCache<u32, Blob> = MemoryCache::new(1000);
        cache.put(1, Blob(10));
        cache.put(2, Blob(10));

        cache.clear().unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.memory_usage(), 0);
    }

    #[test]
    fn test_policy_ranks_victims() {
        let clock = Arc::new(ManualClock::new(0));
        let policy = Arc::new(EvictionPolicy::with_clock(clock.clone()));
        policy.set_strategy(EvictionStrategy::Lfu);

        let cache: MemoryCache<u32, Blob> =
            MemoryCache::new(10_000).with_policy(policy.clone(), CacheKind::Thumbnail);
        cache.put(1, Blob(100));
        cache.put(2, Blob(100));
        // Key 1 is the oldest but the most used
        for _ in 0..5 {
            cache.get(&1);
        }

        cache.evict_lru(100).unwrap();
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(policy.access_info("Thumbnail:2").is_none());
        assert_eq!(policy.strategy_stats(EvictionStrategy::Lfu).evictions_performed, 1);
    }

    #[test]
    fn test_only_victims_are_attributed_to_strategy() {
        let policy = Arc::new(EvictionPolicy::with_clock(Arc::new(ManualClock::new(0))));
        let cache: MemoryCache<u32, Blob> =
            MemoryCache::new(10_000).with_policy(policy.clone(), CacheKind::PdfRender);
        for key in 0..3 {
            cache.put(key, Blob(100));
        }

        cache.evict_lru(100).unwrap();
        policy.set_strategy(EvictionStrategy::Lfu);
        cache.evict_lru(100).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(policy.strategy_stats(EvictionStrategy::Lru).evictions_performed, 1);
        assert_eq!(policy.strategy_stats(EvictionStrategy::Lfu).evictions_performed, 1);
    }

    #[test]
    fn test_removal_forgets_policy_history() {
        let policy = Arc::new(EvictionPolicy::new());
        let cache: MemoryCache<u32, Blob> =
            MemoryCache::new(10_000).with_policy(policy.clone(), CacheKind::PdfRender);
        for key in 0..6 {
            cache.put(key, Blob(10));
        }
        assert_eq!(policy.tracked_items(), 6);

        cache.remove(&0);
        assert!(policy.access_info("PdfRender:0").is_none());
        assert_eq!(cache.remove_where(|k| k % 2 == 1), 3);
        assert_eq!(policy.tracked_items(), 2);
        cache.clear().unwrap();
        assert_eq!(policy.tracked_items(), 0);
    }

    #[test]
    fn test_page_text_ids_match_registry_notifications() {
        let policy = Arc::new(EvictionPolicy::new());
        let registry = crate::CacheRegistry::new(crate::GlobalConfig::default()).with_policy(policy.clone());
        let text = PageTextCache::new(1024 * 1024).with_policy(policy.clone());

        text.put("doc", 1, "hello");
        registry.notify_access(CacheKind::PageText, "doc_1");
        assert_eq!(policy.tracked_items(), 1);
        assert_eq!(policy.access_info("PageText:doc_1").unwrap().access_count, 2);

        text.put("doc", 2, "world");
        assert_eq!(text.invalidate_document("doc"), 2);
        assert_eq!(policy.tracked_items(), 0);
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let cache: Arc<MemoryCache<u64, Blob>> = Arc::new(MemoryCache::new(50_000));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in t * 1000..t * 1000 + 500 {
                        cache.put(i, Blob(256));
                        cache.get(&i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.memory_usage() <= 50_000);
        assert_eq!(cache.memory_usage(), cache.len() as i64 * 256);
    }

    #[test]
    fn test_page_text_cache() {
        let cache = PageTextCache::new(1024 * 1024);
        assert!(cache.put("doc-a", 1, "Lorem ipsum"));
        assert!(cache.put("doc-a", 2, "dolor sit amet"));
        assert!(cache.put("doc-b", 1, "consectetur"));

        assert_eq!(cache.get("doc-a", 2).as_deref(), Some("dolor sit amet"));
        assert!(cache.get("doc-a", 9).is_none());
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(cache.miss_count(), 1);

        assert_eq!(cache.invalidate_document("doc-a"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("doc-b", 1));
        assert!(cache.invalidate_page("doc-b", 1));
        assert_eq!(cache.memory_usage(), 0);
    }

    #[test]
    fn test_page_key_display() {
        let key = PageKey {
            document_id: "report".to_string(),
            page: 7,
        };
        assert_eq!(key.to_string(), "report_7");
    }
}
