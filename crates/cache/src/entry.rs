//! The contract every registrable cache implements

use crate::error::EntryError;
use crate::types::CacheStats;

/// Capability set the registry needs from a cache
///
/// All methods take `&self`: implementations guard their own state (usually
/// with a `parking_lot::Mutex`) so the registry can hold a shared, non-owning
/// handle. Calls never block on I/O.
///
/// Byte counts are `i64` so callers can pass through arithmetic results
/// without casting; negative requests are treated as zero.
pub trait CacheEntry: Send + Sync {
    /// Bytes currently held
    fn memory_usage(&self) -> i64;

    /// Byte budget
    fn max_memory_limit(&self) -> i64;

    /// Change the byte budget, evicting immediately if usage now exceeds it
    fn set_max_memory_limit(&self, bytes: i64);

    /// Drop every entry
    fn clear(&self) -> Result<(), EntryError>;

    /// Number of entries currently held
    fn entry_count(&self) -> i32;

    /// Evict least valuable entries until at least `bytes_to_free` bytes are
    /// released or the cache is empty. Returns the bytes actually released.
    fn evict_lru(&self, bytes_to_free: i64) -> Result<i64, EntryError>;

    fn hit_count(&self) -> i64;

    fn miss_count(&self) -> i64;

    /// Zero the hit and miss counters
    fn reset_statistics(&self);

    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Shrink entries that have not been used recently. Returns bytes saved.
    ///
    /// Caches without a compact representation keep the default.
    fn compress_inactive(&self) -> Result<i64, EntryError> {
        Ok(0)
    }

    /// Snapshot of the cache's counters
    fn stats(&self) -> CacheStats {
        CacheStats::new(
            self.memory_usage(),
            self.max_memory_limit(),
            self.entry_count(),
            self.hit_count(),
            self.miss_count(),
        )
    }
}

/// Types that can report the bytes they occupy in a cache
pub trait MemoryFootprint {
    /// Estimated heap and inline size in bytes
    fn memory_footprint(&self) -> i64;
}

impl MemoryFootprint for String {
    fn memory_footprint(&self) -> i64 {
        (self.len() + std::mem::size_of::<String>()) as i64
    }
}

impl MemoryFootprint for Vec<u8> {
    fn memory_footprint(&self) -> i64 {
        (self.len() + std::mem::size_of::<Vec<u8>>()) as i64
    }
}
