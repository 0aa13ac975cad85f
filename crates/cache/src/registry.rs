//! Central coordinator for the reader's caches
//!
//! [`CacheRegistry`] tracks one cache per [`CacheKind`] through the
//! [`CacheEntry`] contract. It owns limits and statistics but never the cached
//! bytes: registrations are non-owning [`Weak`] handles, so a cache dropped
//! without unregistering is detected and pruned instead of dereferenced.
//!
//! The registry lock guards bookkeeping only. Live handles are copied out and
//! the lock is released before any call into a cache, so a cache that emits
//! events from `evict_lru` or `set_max_memory_limit` may have listeners that
//! call straight back into the registry. Registry events are likewise emitted
//! with no lock held. Below the registry, the cache's own lock comes before
//! the eviction policy's.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use pdf_reader_cache::{CacheEntry, CacheKind, CacheRegistry, GlobalConfig, PageTextCache};
//!
//! let registry = CacheRegistry::new(GlobalConfig::default());
//! let text = Arc::new(PageTextCache::new(1024 * 1024));
//! registry.register(CacheKind::PageText, &text).unwrap();
//!
//! text.put("doc", 1, "Lorem ipsum");
//! assert!(registry.total_usage() > 0);
//!
//! registry.set_limit(CacheKind::PageText, 0);
//! assert_eq!(text.memory_usage(), 0);
//! ```

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use pdf_reader_scheduler::{IntervalScheduler, TaskId};

use crate::config::GlobalConfig;
use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, EventBus};
use crate::policy::EvictionPolicy;
use crate::pressure::{MemoryPressureLevel, PressureThresholds};
use crate::system::{OsMemoryProbe, SystemMemoryProbe};
use crate::types::{hit_ratio, CacheKind, CacheStats, EvictionStrategy};

/// Pressure eviction aims for this fraction of the global limit
pub const PRESSURE_TARGET_RATIO: f64 = 0.70;

/// System pressure eviction aims this far below the system threshold
pub const SYSTEM_TARGET_MARGIN: f64 = 0.10;

/// Distribution rebalancing gives a kind at most this share per unit factor
const DISTRIBUTION_SHARE: f64 = 0.15;

/// Distribution rebalancing never gives a kind less than this share
const DISTRIBUTION_FLOOR: f64 = 0.05;

const PRESSURE_CHECK_INTERVAL_MS: u64 = 5_000;
const STATS_INTERVAL_MS: u64 = 10_000;

/// Outcome of a sweep over several caches
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Caches the sweep touched
    pub visited: usize,
    /// Bytes the caches reported releasing
    pub bytes_freed: i64,
    /// Caches that failed; the sweep carried on without them
    pub failures: Vec<CacheError>,
}

impl SweepReport {
    /// No cache failed
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn absorb(&mut self, other: SweepReport) {
        self.visited += other.visited;
        self.bytes_freed += other.bytes_freed;
        self.failures.extend(other.failures);
    }
}

/// Outcome of [`CacheRegistry::handle_memory_pressure`]
#[derive(Debug)]
pub struct PressureReport {
    pub ratio: f64,
    pub level: MemoryPressureLevel,
    pub sweep: SweepReport,
}

#[derive(Default)]
struct KindCounters {
    hits: AtomicI64,
    misses: AtomicI64,
    /// Bumped by every notification; compared between compression passes
    activity: AtomicU64,
}

impl KindCounters {
    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

struct Slot {
    kind: CacheKind,
    cache: Weak<dyn CacheEntry>,
}

struct RegistryState {
    config: GlobalConfig,
    /// Registration order
    slots: Vec<Slot>,
    limits: [i64; 5],
    enabled: [bool; 5],
    strategies: [EvictionStrategy; 5],
    thresholds: PressureThresholds,
    /// Hit ratio per kind captured by the last pattern analysis
    usage_patterns: Vec<(CacheKind, f64)>,
    /// Activity counter seen by the previous compression pass
    compressed_activity: [u64; 5],
}

impl RegistryState {
    fn new(config: GlobalConfig) -> Self {
        let mut state = Self {
            thresholds: config.thresholds(),
            config,
            slots: Vec::new(),
            limits: [0; 5],
            enabled: [true; 5],
            strategies: [EvictionStrategy::default(); 5],
            usage_patterns: Vec::new(),
            compressed_activity: [0; 5],
        };
        state.load_limits();
        state
    }

    fn load_limits(&mut self) {
        for kind in CacheKind::ALL {
            self.limits[kind.index()] = self.config.limit_for(kind);
        }
    }

    fn position(&self, kind: CacheKind) -> Option<usize> {
        self.slots.iter().position(|s| s.kind == kind)
    }

    /// Live cache registered for `kind`; a dead registration is dropped
    fn live(&mut self, kind: CacheKind) -> Option<Arc<dyn CacheEntry>> {
        let pos = self.position(kind)?;
        match self.slots[pos].cache.upgrade() {
            Some(cache) => Some(cache),
            None => {
                tracing::warn!(kind = %kind, "registered cache was dropped without unregistering");
                self.slots.remove(pos);
                None
            }
        }
    }

    /// Every live registration in registration order, pruning dead ones
    fn live_all(&mut self) -> Vec<(CacheKind, Arc<dyn CacheEntry>)> {
        let mut live = Vec::with_capacity(self.slots.len());
        self.slots.retain(|slot| match slot.cache.upgrade() {
            Some(cache) => {
                live.push((slot.kind, cache));
                true
            }
            None => {
                tracing::warn!(kind = %slot.kind, "registered cache was dropped without unregistering");
                false
            }
        });
        live
    }

    fn live_enabled(&mut self) -> Vec<(CacheKind, Arc<dyn CacheEntry>)> {
        let enabled = self.enabled;
        self.live_all()
            .into_iter()
            .filter(|(kind, _)| enabled[kind.index()])
            .collect()
    }
}

/// Run a contract call, turning a panic into an error
fn guarded<T>(kind: CacheKind, op: &'static str, f: impl FnOnce() -> T) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|_| {
        tracing::warn!(kind = %kind, op, "cache operation panicked");
        CacheError::CacheOperationPanicked(kind)
    })
}

fn usage_of(kind: CacheKind, cache: &dyn CacheEntry) -> Result<i64> {
    guarded(kind, "memory_usage", || cache.memory_usage()).map(|usage| usage.max(0))
}

fn evict(kind: CacheKind, cache: &dyn CacheEntry, bytes: i64) -> Result<i64> {
    if bytes <= 0 {
        return Ok(0);
    }
    match guarded(kind, "evict_lru", || cache.evict_lru(bytes))? {
        Ok(freed) => Ok(freed.max(0)),
        Err(source) => {
            tracing::warn!(kind = %kind, bytes, error = %source, "eviction failed");
            Err(CacheError::EvictionFailed { kind, source })
        }
    }
}

fn total_of(caches: &[(CacheKind, Arc<dyn CacheEntry>)]) -> i64 {
    caches
        .iter()
        .map(|(kind, cache)| usage_of(*kind, cache.as_ref()).unwrap_or(0))
        .sum()
}

struct Timers {
    scheduler: Arc<IntervalScheduler>,
    cleanup: TaskId,
    pressure: TaskId,
    stats: TaskId,
    system: TaskId,
}

/// Registry of the reader's caches
///
/// One instance is created by the application's composition root (see
/// [`CacheEngine`](crate::CacheEngine)) and shared by handle.
pub struct CacheRegistry {
    state: Mutex<RegistryState>,
    counters: [KindCounters; 5],
    policy: Arc<EvictionPolicy>,
    probe: Arc<dyn SystemMemoryProbe>,
    events: EventBus<CacheEvent>,
    timers: Mutex<Option<Timers>>,
}

impl CacheRegistry {
    pub fn new(config: GlobalConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState::new(config)),
            counters: Default::default(),
            policy: Arc::new(EvictionPolicy::new()),
            probe: Arc::new(OsMemoryProbe),
            events: EventBus::new(),
            timers: Mutex::new(None),
        }
    }

    /// Share `policy` with the caches that rank victims through it
    pub fn with_policy(mut self, policy: Arc<EvictionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Read system memory from `probe` instead of the operating system
    pub fn with_probe(mut self, probe: Arc<dyn SystemMemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn events(&self) -> &EventBus<CacheEvent> {
        &self.events
    }

    pub fn policy(&self) -> &Arc<EvictionPolicy> {
        &self.policy
    }

    fn snapshot_all(&self) -> Vec<(CacheKind, Arc<dyn CacheEntry>)> {
        self.state.lock().live_all()
    }

    fn snapshot_enabled(&self) -> Vec<(CacheKind, Arc<dyn CacheEntry>)> {
        self.state.lock().live_enabled()
    }

    // ---- registration ----

    /// Register `cache` for `kind`, replacing any previous registration
    ///
    /// The registry keeps only a weak handle; the caller keeps ownership. The
    /// configured limit for the kind is applied to the cache; a limit of 0
    /// leaves it empty.
    pub fn register<C: CacheEntry + 'static>(&self, kind: CacheKind, cache: &Arc<C>) -> Result<()> {
        let weak: Weak<dyn CacheEntry> = Arc::downgrade(cache) as Weak<C>;
        self.register_weak(kind, weak)
    }

    /// Register an already type-erased cache
    pub fn register_shared(&self, kind: CacheKind, cache: &Arc<dyn CacheEntry>) -> Result<()> {
        self.register_weak(kind, Arc::downgrade(cache))
    }

    /// Register a weak handle. Fails with `InvalidCache` if it is already dead.
    pub fn register_weak(&self, kind: CacheKind, cache: Weak<dyn CacheEntry>) -> Result<()> {
        self.insert(kind, cache, true)
    }

    /// Register only if no live cache holds the slot
    pub fn register_if_absent<C: CacheEntry + 'static>(
        &self,
        kind: CacheKind,
        cache: &Arc<C>,
    ) -> Result<()> {
        let weak: Weak<dyn CacheEntry> = Arc::downgrade(cache) as Weak<C>;
        self.insert(kind, weak, false)
    }

    fn insert(&self, kind: CacheKind, weak: Weak<dyn CacheEntry>, replace: bool) -> Result<()> {
        let cache = weak.upgrade().ok_or(CacheError::InvalidCache(kind))?;

        let limit = {
            let mut state = self.state.lock();
            if !replace && state.live(kind).is_some() {
                return Err(CacheError::AlreadyRegistered(kind));
            }
            state.limits[kind.index()]
        };
        guarded(kind, "set_max_memory_limit", || cache.set_max_memory_limit(limit))?;

        let mut state = self.state.lock();
        if !replace && state.live(kind).is_some() {
            return Err(CacheError::AlreadyRegistered(kind));
        }
        match state.position(kind) {
            Some(pos) => {
                tracing::debug!(kind = %kind, "replacing cache registration");
                state.slots[pos].cache = weak;
            }
            None => state.slots.push(Slot { kind, cache: weak }),
        }
        drop(state);

        tracing::info!(kind = %kind, limit, "cache registered");
        Ok(())
    }

    /// Stop tracking `kind`. Returns whether a registration existed.
    pub fn unregister(&self, kind: CacheKind) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.position(kind) else {
            return false;
        };
        state.slots.remove(pos);
        state.enabled[kind.index()] = true;
        state.usage_patterns.retain(|(k, _)| *k != kind);
        drop(state);

        self.counters[kind.index()].reset();
        tracing::debug!(kind = %kind, "cache unregistered");
        true
    }

    /// Whether a live cache is registered for `kind`
    pub fn is_registered(&self, kind: CacheKind) -> bool {
        self.state.lock().live(kind).is_some()
    }

    /// Kinds with a live registration, in registration order
    pub fn registered_kinds(&self) -> Vec<CacheKind> {
        self.snapshot_all().into_iter().map(|(kind, _)| kind).collect()
    }

    // ---- limits and configuration ----

    /// Set the byte limit of `kind`, applying it to the registered cache
    pub fn set_limit(&self, kind: CacheKind, bytes: i64) {
        let bytes = bytes.max(0);
        let cache = {
            let mut state = self.state.lock();
            state.limits[kind.index()] = bytes;
            state.config.set_limit_for(kind, bytes);
            state.live(kind)
        };
        if let Some(cache) = cache {
            // A panic is already logged by `guarded`
            let _ = guarded(kind, "set_max_memory_limit", || cache.set_max_memory_limit(bytes));
        }
    }

    pub fn get_limit(&self, kind: CacheKind) -> i64 {
        self.state.lock().limits[kind.index()]
    }

    /// Set pressure thresholds, clamped into a valid pair
    ///
    /// Returns the thresholds actually applied.
    pub fn set_pressure_thresholds(&self, warning: f64, critical: f64) -> PressureThresholds {
        let (w, c, adjusted) = PressureThresholds::clamp(warning, critical);
        if adjusted {
            tracing::warn!(warning, critical, applied_warning = w, applied_critical = c, "pressure thresholds clamped");
        }
        let thresholds = PressureThresholds::new(w, c);
        let mut state = self.state.lock();
        state.thresholds = thresholds;
        state.config.warning_threshold = w;
        state.config.critical_threshold = c;
        thresholds
    }

    pub fn pressure_thresholds(&self) -> PressureThresholds {
        self.state.lock().thresholds
    }

    /// Replace the whole configuration
    ///
    /// Per-kind limits are reloaded and applied to registered caches, and
    /// running timers pick up the new intervals.
    pub fn set_global_config(&self, config: GlobalConfig) {
        if let Err(err) = config.validate() {
            tracing::warn!(error = %err, "configuration adjusted while applying");
        }
        let cleanup = config.cleanup_interval();
        let system = config.system_memory_check_interval();
        let monitoring = config.enable_system_memory_monitoring;

        let (limits, caches) = {
            let mut state = self.state.lock();
            state.thresholds = config.thresholds();
            state.config = config;
            state.load_limits();
            (state.limits, state.live_all())
        };
        for (kind, cache) in &caches {
            let limit = limits[kind.index()];
            let _ = guarded(*kind, "set_max_memory_limit", || cache.set_max_memory_limit(limit));
        }

        if let Some(timers) = self.timers.lock().as_ref() {
            timers.scheduler.set_interval(timers.cleanup, cleanup);
            timers.scheduler.set_interval(timers.system, system);
            if monitoring {
                timers.scheduler.resume(timers.system);
            } else {
                timers.scheduler.pause(timers.system);
            }
        }

        tracing::info!("cache configuration changed");
        self.events.emit(CacheEvent::ConfigChanged);
    }

    pub fn global_config(&self) -> GlobalConfig {
        self.state.lock().config.clone()
    }

    /// Enable or disable a kind
    ///
    /// Disabled caches are skipped by usage totals and sweeps. The flag is
    /// forwarded to the registered cache.
    pub fn enable_cache(&self, kind: CacheKind, enabled: bool) {
        let cache = {
            let mut state = self.state.lock();
            state.enabled[kind.index()] = enabled;
            state.live(kind)
        };
        if let Some(cache) = cache {
            let _ = guarded(kind, "set_enabled", || cache.set_enabled(enabled));
        }
    }

    pub fn is_cache_enabled(&self, kind: CacheKind) -> bool {
        self.state.lock().enabled[kind.index()]
    }

    pub fn set_eviction_strategy(&self, kind: CacheKind, strategy: EvictionStrategy) {
        self.state.lock().strategies[kind.index()] = strategy;
    }

    pub fn eviction_strategy(&self, kind: CacheKind) -> EvictionStrategy {
        self.state.lock().strategies[kind.index()]
    }

    pub fn set_emergency_eviction_enabled(&self, enabled: bool) {
        self.state.lock().config.enable_emergency_eviction = enabled;
    }

    pub fn set_adaptive_management_enabled(&self, enabled: bool) {
        self.state.lock().config.enable_adaptive_management = enabled;
    }

    pub fn set_predictive_eviction_enabled(&self, enabled: bool) {
        self.state.lock().config.enable_predictive_eviction = enabled;
    }

    pub fn set_compression_enabled(&self, enabled: bool) {
        self.state.lock().config.enable_compression = enabled;
    }

    // ---- clearing ----

    /// Clear every registered cache
    ///
    /// A cache that fails is logged and skipped; the others are still cleared.
    pub fn clear_all(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for (kind, cache) in self.snapshot_all() {
            report.visited += 1;
            if let Err(err) = self.clear_one(kind, cache.as_ref()) {
                report.failures.push(err);
            }
        }

        for counters in &self.counters {
            counters.reset();
        }
        tracing::debug!(visited = report.visited, failed = report.failures.len(), "cleared all caches");
        report
    }

    /// Clear one cache
    pub fn clear(&self, kind: CacheKind) -> Result<()> {
        let cache = self.state.lock().live(kind).ok_or(CacheError::NotRegistered(kind))?;
        let result = self.clear_one(kind, cache.as_ref());

        self.counters[kind.index()].reset();
        result
    }

    fn clear_one(&self, kind: CacheKind, cache: &dyn CacheEntry) -> Result<()> {
        guarded(kind, "clear", || cache.clear())?.map_err(|source| {
            tracing::warn!(kind = %kind, error = %source, "cache failed to clear");
            CacheError::EvictionFailed { kind, source }
        })
    }

    // ---- usage ----

    /// Bytes held by enabled caches
    pub fn total_usage(&self) -> i64 {
        total_of(&self.snapshot_enabled())
    }

    /// Global byte budget
    pub fn total_limit(&self) -> i64 {
        self.state.lock().config.max_total_memory
    }

    /// `total_usage / total_limit`, 0.0 when the limit is 0
    pub fn usage_ratio(&self) -> f64 {
        let limit = self.total_limit();
        if limit <= 0 {
            return 0.0;
        }
        self.total_usage() as f64 / limit as f64
    }

    // ---- eviction ----

    /// Bring every enabled cache within its own limit, then the total within
    /// the global limit
    ///
    /// Each cache over its limit is asked to evict exactly `usage - limit`.
    /// If the total still exceeds the global limit, `MemoryLimitExceeded` is
    /// emitted and pressure eviction brings it back under. Feature toggles do
    /// not apply here: a clean report means every limit holds.
    pub fn enforce_limits(&self) -> SweepReport {
        self.enforce(true)
    }

    /// Shared by [`enforce_limits`](Self::enforce_limits) and the cleanup
    /// tick, which skips the per-kind trim when LRU eviction is switched off
    fn enforce(&self, per_kind: bool) -> SweepReport {
        let mut report = SweepReport::default();
        let mut events = Vec::new();

        let (caches, limits, global) = {
            let mut state = self.state.lock();
            (state.live_enabled(), state.limits, state.config.max_total_memory)
        };

        if per_kind {
            for (kind, cache) in &caches {
                report.visited += 1;
                let usage = match usage_of(*kind, cache.as_ref()) {
                    Ok(usage) => usage,
                    Err(err) => {
                        report.failures.push(err);
                        continue;
                    }
                };
                let limit = limits[kind.index()];
                if usage > limit {
                    let bytes = usage - limit;
                    events.push(CacheEvent::EvictionRequested { kind: *kind, bytes });
                    match evict(*kind, cache.as_ref(), bytes) {
                        Ok(freed) => report.bytes_freed += freed,
                        Err(err) => report.failures.push(err),
                    }
                }
            }
        }

        let total = total_of(&caches);
        if total > global {
            events.push(CacheEvent::MemoryLimitExceeded { usage: total, limit: global });
            let pressure = Self::pressure_evict(global, &caches, &mut events);
            report.bytes_freed += pressure.bytes_freed;
            report.failures.extend(pressure.failures);
        }

        if report.bytes_freed > 0 {
            tracing::debug!(freed = report.bytes_freed, "memory limits enforced");
        }
        self.emit_all(events);
        report
    }

    /// Shed load down to 70% of the global limit
    ///
    /// Caches are visited from cheapest to most expensive to regenerate, each
    /// giving up at most half of its usage. If the total is still over the
    /// limit a second pass takes whatever is still needed.
    fn pressure_evict(
        global: i64,
        caches: &[(CacheKind, Arc<dyn CacheEntry>)],
        events: &mut Vec<CacheEvent>,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        let target = (global as f64 * PRESSURE_TARGET_RATIO) as i64;

        let mut order: Vec<&(CacheKind, Arc<dyn CacheEntry>)> = caches.iter().collect();
        order.sort_by(|a, b| a.0.importance().total_cmp(&b.0.importance()));

        let mut usage = total_of(caches);
        for second_pass in [false, true] {
            if second_pass && usage <= global {
                break;
            }
            for (kind, cache) in &order {
                if usage <= target {
                    break;
                }
                let cache_usage = match usage_of(*kind, cache.as_ref()) {
                    Ok(u) => u,
                    Err(err) => {
                        report.failures.push(err);
                        continue;
                    }
                };
                let need = usage - target;
                let bytes = if second_pass { need.min(cache_usage) } else { need.min(cache_usage / 2) };
                if bytes <= 0 {
                    continue;
                }
                report.visited += 1;
                events.push(CacheEvent::EvictionRequested { kind: *kind, bytes });
                match evict(*kind, cache.as_ref(), bytes) {
                    Ok(freed) => {
                        usage -= freed;
                        report.bytes_freed += freed;
                    }
                    Err(err) => report.failures.push(err),
                }
            }
        }

        tracing::debug!(target, remaining = usage, freed = report.bytes_freed, "pressure eviction");
        report
    }

    /// React to the cache usage ratio
    ///
    /// At Warning or above, limits are enforced. At Critical, if emergency
    /// eviction is enabled, the registry also sheds down to 70% of the global
    /// limit.
    pub fn handle_memory_pressure(&self) -> PressureReport {
        let (caches, limit, thresholds, emergency) = {
            let mut state = self.state.lock();
            (
                state.live_enabled(),
                state.config.max_total_memory,
                state.thresholds,
                state.config.enable_emergency_eviction,
            )
        };
        let ratio = if limit > 0 { total_of(&caches) as f64 / limit as f64 } else { 0.0 };
        let level = thresholds.level(ratio);
        drop(caches);

        let mut sweep = SweepReport::default();
        if level < MemoryPressureLevel::Warning {
            return PressureReport { ratio, level, sweep };
        }

        tracing::debug!(ratio, ?level, "memory pressure detected");
        self.events.emit(CacheEvent::PressureDetected { ratio });
        self.events.emit(match level {
            MemoryPressureLevel::Critical => CacheEvent::PressureCritical { ratio },
            _ => CacheEvent::PressureWarning { ratio },
        });

        sweep.absorb(self.enforce_limits());

        if level == MemoryPressureLevel::Critical && emergency {
            let mut events = Vec::new();
            let caches = self.snapshot_enabled();
            let global = self.total_limit();
            sweep.absorb(Self::pressure_evict(global, &caches, &mut events));
            self.emit_all(events);
        }

        PressureReport { ratio, level, sweep }
    }

    /// Ask the cache of `kind` to free `bytes_to_free`
    ///
    /// An absent cache is not an error: returns `Ok(0)` with no side effects.
    pub fn request_eviction(&self, kind: CacheKind, bytes_to_free: i64) -> Result<i64> {
        if bytes_to_free <= 0 {
            return Ok(0);
        }
        let Some(cache) = self.state.lock().live(kind) else {
            return Ok(0);
        };
        let result = evict(kind, cache.as_ref(), bytes_to_free);

        self.events.emit(CacheEvent::EvictionRequested { kind, bytes: bytes_to_free });
        result
    }

    /// Evict each enabled cache down to its own reported limit
    ///
    /// Emits `OptimizationCompleted` with the bytes released.
    pub fn optimize_memory_layout(&self) -> i64 {
        let mut freed = 0;
        for (kind, cache) in &self.snapshot_enabled() {
            let Ok(before) = usage_of(*kind, cache.as_ref()) else {
                continue;
            };
            let Ok(limit) = guarded(*kind, "max_memory_limit", || cache.max_memory_limit()) else {
                continue;
            };
            if before > limit && evict(*kind, cache.as_ref(), before - limit).is_ok() {
                let after = usage_of(*kind, cache.as_ref()).unwrap_or(before);
                freed += (before - after).max(0);
            }
        }

        self.events.emit(CacheEvent::OptimizationCompleted { bytes_freed: freed });
        freed
    }

    /// Compress caches that saw no activity since the previous pass
    ///
    /// Emits `CompressionCompleted` with the bytes saved.
    pub fn compress_inactive_caches(&self) -> i64 {
        let idle: Vec<(CacheKind, Arc<dyn CacheEntry>)> = {
            let mut state = self.state.lock();
            let caches = state.live_enabled();
            caches
                .into_iter()
                .filter(|(kind, _)| {
                    let activity = self.counters[kind.index()].activity.load(Ordering::Relaxed);
                    let unchanged = state.compressed_activity[kind.index()] == activity;
                    state.compressed_activity[kind.index()] = activity;
                    unchanged
                })
                .collect()
        };

        let mut saved = 0;
        for (kind, cache) in &idle {
            match guarded(*kind, "compress_inactive", || cache.compress_inactive()) {
                Ok(Ok(bytes)) => saved += bytes.max(0),
                Ok(Err(err)) => tracing::warn!(kind = %kind, error = %err, "compression failed"),
                Err(_) => {}
            }
        }

        tracing::debug!(saved, "inactive caches compressed");
        self.events.emit(CacheEvent::CompressionCompleted { bytes_saved: saved });
        saved
    }

    // ---- notifications ----

    /// Record an access to `key` in the cache of `kind`
    ///
    /// Never takes the registry lock and never touches cache contents.
    pub fn notify_access(&self, kind: CacheKind, key: &str) {
        self.counters[kind.index()].activity.fetch_add(1, Ordering::Relaxed);
        self.policy.record_access(&kind.item_id(key));
    }

    pub fn notify_hit(&self, kind: CacheKind, key: &str) {
        self.counters[kind.index()].hits.fetch_add(1, Ordering::Relaxed);
        self.notify_access(kind, key);
    }

    pub fn notify_miss(&self, kind: CacheKind, key: &str) {
        self.counters[kind.index()].misses.fetch_add(1, Ordering::Relaxed);
        self.notify_access(kind, key);
    }

    // ---- statistics ----

    /// Cache counters plus the hits and misses reported via `notify_*`
    fn combined_stats(&self, kind: CacheKind, cache: &dyn CacheEntry) -> Result<CacheStats> {
        let mut stats = guarded(kind, "stats", || cache.stats())?;
        let counters = &self.counters[kind.index()];
        stats.total_hits += counters.hits.load(Ordering::Relaxed);
        stats.total_misses += counters.misses.load(Ordering::Relaxed);
        stats.hit_ratio = hit_ratio(stats.total_hits, stats.total_misses);
        Ok(stats)
    }

    /// Statistics of one cache
    pub fn cache_stats(&self, kind: CacheKind) -> Result<CacheStats> {
        let cache = self.state.lock().live(kind).ok_or(CacheError::NotRegistered(kind))?;
        self.combined_stats(kind, cache.as_ref())
    }

    /// Statistics of every registered cache that reported successfully
    pub fn all_cache_stats(&self) -> Vec<(CacheKind, CacheStats)> {
        self.snapshot_all()
            .iter()
            .filter_map(|(kind, cache)| {
                self.combined_stats(*kind, cache.as_ref())
                    .ok()
                    .map(|stats| (*kind, stats))
            })
            .collect()
    }

    pub fn total_hits(&self) -> i64 {
        self.all_cache_stats().iter().map(|(_, s)| s.total_hits).sum()
    }

    pub fn total_misses(&self) -> i64 {
        self.all_cache_stats().iter().map(|(_, s)| s.total_misses).sum()
    }

    /// Hit ratio over every registered cache
    pub fn global_hit_ratio(&self) -> f64 {
        let stats = self.all_cache_stats();
        let hits = stats.iter().map(|(_, s)| s.total_hits).sum();
        let misses = stats.iter().map(|(_, s)| s.total_misses).sum();
        hit_ratio(hits, misses)
    }

    /// Emit `StatsUpdated` for every cache and `GlobalStatsUpdated`
    pub fn update_statistics(&self) {
        let stats = self.all_cache_stats();
        let total_usage = self.total_usage();
        let hits = stats.iter().map(|(_, s)| s.total_hits).sum();
        let misses = stats.iter().map(|(_, s)| s.total_misses).sum();

        for (kind, stats) in stats {
            self.events.emit(CacheEvent::StatsUpdated { kind, stats });
        }
        self.events.emit(CacheEvent::GlobalStatsUpdated {
            total_usage,
            hit_ratio: hit_ratio(hits, misses),
        });
    }

    // ---- adaptive management ----

    /// Snapshot the hit ratio of every registered cache
    pub fn analyze_usage_patterns(&self) -> Vec<(CacheKind, f64)> {
        let patterns: Vec<(CacheKind, f64)> = self
            .all_cache_stats()
            .into_iter()
            .map(|(kind, stats)| (kind, stats.hit_ratio))
            .collect();
        self.state.lock().usage_patterns = patterns.clone();
        patterns
    }

    /// Redistribute the global budget by hit ratio and importance
    ///
    /// Each analysed kind gets `total * (0.7 * hit_ratio + 0.3 * importance)
    /// * 0.15`, never less than 5% of the total. Returns the new limits.
    pub fn optimize_distribution(&self) -> Vec<(CacheKind, i64)> {
        let (total, patterns) = {
            let state = self.state.lock();
            (state.config.max_total_memory, state.usage_patterns.clone())
        };

        let limits: Vec<(CacheKind, i64)> = patterns
            .into_iter()
            .map(|(kind, ratio)| {
                let factor = ratio * 0.7 + kind.importance() * 0.3;
                let limit = (total as f64 * factor * DISTRIBUTION_SHARE) as i64;
                let floor = (total as f64 * DISTRIBUTION_FLOOR) as i64;
                (kind, limit.max(floor))
            })
            .collect();

        for (kind, limit) in &limits {
            self.set_limit(*kind, *limit);
        }
        tracing::debug!(kinds = limits.len(), "cache budget redistributed");
        limits
    }

    /// One cleanup tick
    ///
    /// Trims caches over their own limit when LRU eviction is on and always
    /// holds the global limit. Pressure handling runs when pressure eviction
    /// is on. Rebalancing follows adaptive management and policy tuning
    /// follows predictive eviction. Statistics are re-sampled last.
    pub fn perform_periodic_cleanup(&self) -> SweepReport {
        let (lru, pressure_eviction, adaptive, predictive) = {
            let state = self.state.lock();
            (
                state.config.enable_lru_eviction,
                state.config.enable_memory_pressure_eviction,
                state.config.enable_adaptive_management,
                state.config.enable_predictive_eviction,
            )
        };

        let mut report = self.enforce(lru);
        if pressure_eviction {
            report.absorb(self.handle_memory_pressure().sweep);
        }
        if adaptive {
            self.analyze_usage_patterns();
            self.optimize_distribution();
        }
        if predictive {
            self.policy.analyze_access_patterns();
            self.policy.update_eviction_strategy();
        }
        self.update_statistics();

        if !report.is_clean() {
            tracing::warn!(failed = report.failures.len(), "periodic cleanup skipped failing caches");
        }
        report
    }

    // ---- system memory ----

    pub fn enable_system_memory_monitoring(&self, enabled: bool) {
        self.state.lock().config.enable_system_memory_monitoring = enabled;
        if let Some(timers) = self.timers.lock().as_ref() {
            if enabled {
                timers.scheduler.resume(timers.system);
            } else {
                timers.scheduler.pause(timers.system);
            }
        }
    }

    pub fn is_system_memory_monitoring_enabled(&self) -> bool {
        self.state.lock().config.enable_system_memory_monitoring
    }

    /// Process resident memory over physical memory, 0.0 when unknown
    pub fn system_memory_pressure(&self) -> f64 {
        self.probe.pressure()
    }

    pub fn system_memory_usage(&self) -> Option<u64> {
        self.probe.process_usage()
    }

    pub fn system_memory_total(&self) -> Option<u64> {
        self.probe.total_memory()
    }

    /// React to system memory pressure
    ///
    /// Above the system threshold, emits `SystemPressureDetected`. With
    /// emergency eviction enabled, frees `rss - total * (threshold - 0.10)`
    /// spread over enabled caches in proportion to their usage, then emits
    /// `EmergencyEvictionTriggered`. Returns the bytes released.
    pub fn handle_system_memory_pressure(&self) -> i64 {
        let (monitoring, threshold, emergency) = {
            let state = self.state.lock();
            (
                state.config.enable_system_memory_monitoring,
                state.config.system_memory_threshold,
                state.config.enable_emergency_eviction,
            )
        };
        if !monitoring {
            return 0;
        }

        let ratio = self.probe.pressure();
        if ratio <= threshold {
            return 0;
        }
        tracing::info!(ratio, threshold, "system memory pressure detected");
        self.events.emit(CacheEvent::SystemPressureDetected { ratio });
        if !emergency {
            return 0;
        }

        let (Some(rss), Some(total)) = (self.probe.process_usage(), self.probe.total_memory()) else {
            return 0;
        };
        let target = (total as f64 * (threshold - SYSTEM_TARGET_MARGIN)) as i64;
        let to_free = i64::try_from(rss).unwrap_or(i64::MAX) - target;
        if to_free <= 0 {
            return 0;
        }

        let mut freed = 0;
        let mut events = Vec::new();
        let caches = self.snapshot_enabled();
        let cache_total = total_of(&caches);
        if cache_total > 0 {
            for (kind, cache) in &caches {
                let Ok(usage) = usage_of(*kind, cache.as_ref()) else {
                    continue;
                };
                let share = (to_free as f64 * usage as f64 / cache_total as f64) as i64;
                if share <= 0 {
                    continue;
                }
                events.push(CacheEvent::EvictionRequested { kind: *kind, bytes: share });
                if let Ok(bytes) = evict(*kind, cache.as_ref(), share) {
                    freed += bytes;
                }
            }
        }

        self.emit_all(events);
        tracing::warn!(requested = to_free, freed, "emergency eviction");
        self.events.emit(CacheEvent::EmergencyEvictionTriggered { bytes_freed: freed });
        freed
    }

    // ---- timers ----

    /// Arm the periodic loops on `scheduler`
    ///
    /// Cleanup runs every `cleanup_interval`, pressure checks every 5 s,
    /// statistics every 10 s and the system probe every
    /// `system_memory_check_interval` (paused while monitoring is off).
    /// Tasks hold only a weak handle to the registry. Calling this twice is a
    /// no-op.
    pub fn start_timers(self: &Arc<Self>, scheduler: &Arc<IntervalScheduler>) {
        let mut timers = self.timers.lock();
        if timers.is_some() {
            return;
        }

        let (cleanup_every, system_every, monitoring) = {
            let state = self.state.lock();
            (
                state.config.cleanup_interval(),
                state.config.system_memory_check_interval(),
                state.config.enable_system_memory_monitoring,
            )
        };

        let cleanup = scheduler.schedule(
            "cache-cleanup",
            cleanup_every,
            self.tick(|registry| {
                registry.perform_periodic_cleanup();
            }),
        );
        let pressure = scheduler.schedule(
            "cache-pressure",
            std::time::Duration::from_millis(PRESSURE_CHECK_INTERVAL_MS),
            self.tick(|registry| {
                registry.handle_memory_pressure();
            }),
        );
        let stats = scheduler.schedule(
            "cache-stats",
            std::time::Duration::from_millis(STATS_INTERVAL_MS),
            self.tick(CacheRegistry::update_statistics),
        );
        let system = scheduler.schedule(
            "system-memory",
            system_every,
            self.tick(|registry| {
                registry.handle_system_memory_pressure();
            }),
        );
        if !monitoring {
            scheduler.pause(system);
        }

        *timers = Some(Timers {
            scheduler: scheduler.clone(),
            cleanup,
            pressure,
            stats,
            system,
        });
        tracing::debug!("cache registry timers started");
    }

    fn tick(self: &Arc<Self>, f: fn(&CacheRegistry)) -> impl Fn() + Send + Sync + 'static {
        let weak = Arc::downgrade(self);
        move || {
            if let Some(registry) = weak.upgrade() {
                f(&registry);
            }
        }
    }

    /// Whether the periodic loops are armed
    pub fn timers_running(&self) -> bool {
        self.timers.lock().is_some()
    }

    /// Cancel the periodic loops. Idempotent and callable from any thread,
    /// including from inside a timer callback.
    pub fn stop_all_timers(&self) {
        let Some(timers) = self.timers.lock().take() else {
            return;
        };
        for id in [timers.cleanup, timers.pressure, timers.stats, timers.system] {
            timers.scheduler.cancel(id);
        }
        tracing::debug!("cache registry timers stopped");
    }

    fn emit_all(&self, events: Vec<CacheEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }
}

impl Drop for CacheRegistry {
    fn drop(&mut self) {
        self.stop_all_timers();
    }
}
