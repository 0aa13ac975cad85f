//! Core value types shared by the cache engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Role of a cache tracked by the registry
///
/// The set is closed: every cache the reader maintains fills exactly one of
/// these slots, and at most one live cache is registered per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheKind {
    /// Search result lists
    SearchResult,
    /// Extracted page text
    PageText,
    /// Search match highlight geometry
    SearchHighlight,
    /// Rendered page bitmaps
    PdfRender,
    /// Page thumbnails
    Thumbnail,
}

impl CacheKind {
    /// Every kind, in registration-slot order
    pub const ALL: [CacheKind; 5] = [
        CacheKind::SearchResult,
        CacheKind::PageText,
        CacheKind::SearchHighlight,
        CacheKind::PdfRender,
        CacheKind::Thumbnail,
    ];

    /// Human-readable name used in logs and config keys
    pub fn name(&self) -> &'static str {
        match self {
            CacheKind::SearchResult => "SearchResult",
            CacheKind::PageText => "PageText",
            CacheKind::SearchHighlight => "SearchHighlight",
            CacheKind::PdfRender => "PdfRender",
            CacheKind::Thumbnail => "Thumbnail",
        }
    }

    /// Policy id of `key` in a cache of this kind, e.g. `PageText:doc_3`
    ///
    /// Caches and registry notifications share the format so both feed the
    /// same access history.
    pub fn item_id(&self, key: impl fmt::Display) -> String {
        format!("{}:{}", self.name(), key)
    }

    /// How expensive the kind's contents are to regenerate (0.0 to 1.0)
    ///
    /// Cheap kinds are sacrificed first under pressure.
    pub fn importance(&self) -> f64 {
        match self {
            CacheKind::SearchResult => 0.9,
            CacheKind::PageText => 0.8,
            CacheKind::PdfRender => 0.7,
            CacheKind::SearchHighlight => 0.5,
            CacheKind::Thumbnail => 0.3,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            CacheKind::SearchResult => 0,
            CacheKind::PageText => 1,
            CacheKind::SearchHighlight => 2,
            CacheKind::PdfRender => 3,
            CacheKind::Thumbnail => 4,
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Statistics reported by a single cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Bytes currently held
    pub memory_usage: i64,

    /// Byte budget of the cache
    pub max_memory_limit: i64,

    /// Number of entries currently held
    pub entry_count: i32,

    /// Entry-count cap, 0 when the cache is bounded by bytes only
    pub max_entry_limit: i32,

    /// Cached `total_hits / (total_hits + total_misses)`
    pub hit_ratio: f64,

    /// Lookups served from the cache
    pub total_hits: i64,

    /// Lookups that missed
    pub total_misses: i64,
}

impl CacheStats {
    /// Build stats and derive the hit ratio from the counters
    pub fn new(
        memory_usage: i64,
        max_memory_limit: i64,
        entry_count: i32,
        total_hits: i64,
        total_misses: i64,
    ) -> Self {
        Self {
            memory_usage,
            max_memory_limit,
            entry_count,
            max_entry_limit: 0,
            hit_ratio: hit_ratio(total_hits, total_misses),
            total_hits,
            total_misses,
        }
    }

    /// Fraction of the byte budget in use (0.0 when the budget is 0)
    pub fn memory_utilization(&self) -> f64 {
        if self.max_memory_limit <= 0 {
            0.0
        } else {
            self.memory_usage as f64 / self.max_memory_limit as f64
        }
    }
}

/// `hits / (hits + misses)`, 0.0 when nothing was looked up
pub fn hit_ratio(hits: i64, misses: i64) -> f64 {
    let total = hits.saturating_add(misses);
    if total <= 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// How eagerly the optimizer reclaims memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptimizationLevel {
    /// Act only under critical pressure
    Conservative,
    /// Act from warning pressure onward
    Balanced,
    /// Act on every pass
    Aggressive,
}

impl OptimizationLevel {
    /// Period of the optimizer's maintenance loop at this level
    pub fn interval(&self) -> Duration {
        match self {
            OptimizationLevel::Conservative => Duration::from_secs(60),
            OptimizationLevel::Balanced => Duration::from_secs(30),
            OptimizationLevel::Aggressive => Duration::from_secs(15),
        }
    }

    /// Fraction of current usage a fractional eviction pass removes
    pub fn eviction_fraction(&self) -> f64 {
        match self {
            OptimizationLevel::Conservative => 0.0,
            OptimizationLevel::Balanced => 0.15,
            OptimizationLevel::Aggressive => 0.25,
        }
    }

    /// Number of highest-churn kinds a fractional eviction pass touches
    pub fn eviction_breadth(&self) -> usize {
        match self {
            OptimizationLevel::Conservative => 0,
            OptimizationLevel::Balanced => 2,
            OptimizationLevel::Aggressive => 3,
        }
    }
}

impl Default for OptimizationLevel {
    fn default() -> Self {
        OptimizationLevel::Balanced
    }
}

/// Scoring formula used to rank eviction candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvictionStrategy {
    /// Least recently used
    Lru,
    /// Least frequently used
    Lfu,
    /// Recency, frequency and access rhythm blended
    Adaptive,
    /// Estimated likelihood of imminent re-access
    Predictive,
}

impl EvictionStrategy {
    pub const ALL: [EvictionStrategy; 4] = [
        EvictionStrategy::Lru,
        EvictionStrategy::Lfu,
        EvictionStrategy::Adaptive,
        EvictionStrategy::Predictive,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EvictionStrategy::Lru => "LRU",
            EvictionStrategy::Lfu => "LFU",
            EvictionStrategy::Adaptive => "Adaptive",
            EvictionStrategy::Predictive => "Predictive",
        }
    }
}

impl Default for EvictionStrategy {
    fn default() -> Self {
        EvictionStrategy::Lru
    }
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown strategy name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown eviction strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl FromStr for EvictionStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionStrategy::Lru),
            "lfu" => Ok(EvictionStrategy::Lfu),
            "adaptive" => Ok(EvictionStrategy::Adaptive),
            "predictive" => Ok(EvictionStrategy::Predictive),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}
