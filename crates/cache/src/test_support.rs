//! Test doubles shared by unit tests

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crate::entry::CacheEntry;
use crate::error::EntryError;

/// Cache double with directly settable usage
#[derive(Default)]
pub(crate) struct StubCache {
    pub(crate) usage: AtomicI64,
    pub(crate) limit: AtomicI64,
    pub(crate) hits: AtomicI64,
    pub(crate) misses: AtomicI64,
    pub(crate) enabled: AtomicBool,
    pub(crate) fail_evict: AtomicBool,
    pub(crate) panic_evict: AtomicBool,
    pub(crate) evict_calls: AtomicI64,
    pub(crate) compressed: AtomicI64,
}

impl StubCache {
    pub(crate) fn with_usage(usage: i64) -> Arc<Self> {
        let cache = Self::default();
        cache.usage.store(usage, Ordering::SeqCst);
        cache.enabled.store(true, Ordering::SeqCst);
        Arc::new(cache)
    }

    pub(crate) fn usage(&self) -> i64 {
        self.usage.load(Ordering::SeqCst)
    }
}

impl CacheEntry for StubCache {
    fn memory_usage(&self) -> i64 {
        self.usage()
    }

    fn max_memory_limit(&self) -> i64 {
        self.limit.load(Ordering::SeqCst)
    }

    fn set_max_memory_limit(&self, bytes: i64) {
        self.limit.store(bytes, Ordering::SeqCst);
    }

    fn clear(&self) -> std::result::Result<(), EntryError> {
        if self.fail_evict.load(Ordering::SeqCst) {
            return Err(EntryError::Failed("locked".into()));
        }
        self.usage.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn entry_count(&self) -> i32 {
        (self.usage() / 10) as i32
    }

    fn evict_lru(&self, bytes: i64) -> std::result::Result<i64, EntryError> {
        self.evict_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_evict.load(Ordering::SeqCst) {
            panic!("evict_lru exploded");
        }
        if self.fail_evict.load(Ordering::SeqCst) {
            return Err(EntryError::Unavailable("busy".into()));
        }
        let freed = bytes.min(self.usage());
        self.usage.fetch_sub(freed, Ordering::SeqCst);
        Ok(freed)
    }

    fn hit_count(&self) -> i64 {
        self.hits.load(Ordering::SeqCst)
    }

    fn miss_count(&self) -> i64 {
        self.misses.load(Ordering::SeqCst)
    }

    fn reset_statistics(&self) {
        self.hits.store(0, Ordering::SeqCst);
        self.misses.store(0, Ordering::SeqCst);
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn compress_inactive(&self) -> std::result::Result<i64, EntryError> {
        self.compressed.fetch_add(1, Ordering::SeqCst);
        Ok(7)
    }
}
