//! PDF Reader Cache Library
//!
//! Cache coordination and eviction engine for the reader's in-memory caches.
//!
//! - [`CacheRegistry`] tracks one cache per [`CacheKind`], enforces per-kind
//!   and global byte budgets and reacts to memory pressure.
//! - [`EvictionPolicy`] scores items by recency, frequency and access rhythm
//!   and recommends a strategy from observed patterns.
//! - [`MemoryOptimizer`] runs optimization passes at a configurable
//!   [`OptimizationLevel`].
//! - [`MemoryCache`], [`PageTextCache`] and [`BoundedResultStore`] are
//!   concrete caches implementing [`CacheEntry`].
//! - [`CacheEngine`] wires everything onto one background scheduler.

pub mod clock;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod events;
pub mod memory_cache;
pub mod optimizer;
pub mod policy;
pub mod pressure;
pub mod registry;
pub mod results;
pub mod system;
pub mod types;

#[cfg(test)]
mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GlobalConfig;
pub use engine::CacheEngine;
pub use entry::{CacheEntry, MemoryFootprint};
pub use error::{CacheError, ConfigError, EntryError, Result};
pub use events::{CacheEvent, EventBus, ListenerId};
pub use memory_cache::{MemoryCache, PageKey, PageText, PageTextCache};
pub use optimizer::{MemoryOptimizer, MemoryStats, OptimizerEvent, PressureSignal, SignalResponse};
pub use policy::{AccessInfo, AccessPattern, EvictionPolicy, PatternKind, PolicyEvent, StrategyStats};
pub use pressure::{MemoryPressureLevel, PressureThresholds};
pub use registry::{CacheRegistry, PressureReport, SweepReport};
pub use results::{BoundedResultStore, SearchHit, StoreEvent};
pub use system::{FixedMemoryProbe, OsMemoryProbe, SystemMemoryProbe};
pub use types::{hit_ratio, CacheKind, CacheStats, EvictionStrategy, OptimizationLevel, UnknownStrategy};
