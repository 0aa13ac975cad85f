//! Memory optimization control loop
//!
//! [`MemoryOptimizer`] sits above the [`CacheRegistry`]. It watches pressure
//! and runs optimization passes whose aggressiveness is set by an
//! [`OptimizationLevel`]. Registry events reach it only through
//! [`MemoryOptimizer::handle_signal`]; [`MemoryOptimizer::attach`] wires that
//! to the registry's event bus, and tests can call it with synthetic signals.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pdf_reader_scheduler::{IntervalScheduler, TaskId};

use crate::clock::{Clock, SystemClock};
use crate::events::{CacheEvent, EventBus, ListenerId};
use crate::pressure::MemoryPressureLevel;
use crate::registry::CacheRegistry;
use crate::types::{CacheKind, OptimizationLevel};

/// Shortest optimization interval accepted
pub const MIN_OPTIMIZATION_INTERVAL: Duration = Duration::from_secs(5);

/// System pressure above which a signal triggers emergency cleanup
pub const EMERGENCY_SYSTEM_RATIO: f64 = 0.90;

/// Share of a cache freed by the targeted `optimize_*_caches` calls
pub const TARGETED_EVICTION_FRACTION: f64 = 0.25;

/// Share of every cache freed by emergency cleanup
pub const EMERGENCY_EVICTION_FRACTION: f64 = 0.5;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Snapshot of memory figures seen by the optimizer
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryStats {
    /// Bytes held by enabled caches
    pub total_memory_usage: i64,
    pub search_cache_memory: i64,
    pub text_cache_memory: i64,
    pub highlight_cache_memory: i64,
    /// Resident memory of the process, 0 when unknown
    pub system_memory_usage: i64,
    /// Physical memory, 0 when unknown
    pub system_memory_total: i64,
    /// Larger of the cache usage ratio and the system memory ratio
    pub memory_pressure: f64,
    pub pressure_level: MemoryPressureLevel,
    /// Milliseconds since the epoch of the last completed pass
    pub last_optimization_ms: Option<i64>,
    pub optimization_count: u64,
}

impl Default for MemoryStats {
    fn default() -> Self {
        Self {
            total_memory_usage: 0,
            search_cache_memory: 0,
            text_cache_memory: 0,
            highlight_cache_memory: 0,
            system_memory_usage: 0,
            system_memory_total: 0,
            memory_pressure: 0.0,
            pressure_level: MemoryPressureLevel::Normal,
            last_optimization_ms: None,
            optimization_count: 0,
        }
    }
}

/// Events published by the optimizer
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerEvent {
    OptimizationStarted { level: OptimizationLevel },
    OptimizationCompleted { bytes_freed: i64 },
    PressureChanged { level: MemoryPressureLevel },
    StatsUpdated(MemoryStats),
    EmergencyCleanup { bytes_freed: i64 },
    /// Advisory text; never applied automatically
    Recommendation(String),
}

/// Registry signals the optimizer reacts to
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PressureSignal {
    /// Cache usage ratio reached the warning threshold
    PressureDetected(f64),
    /// System memory ratio crossed the system threshold
    SystemPressure(f64),
    /// Total cache usage went over the global limit
    LimitExceeded { usage: i64, limit: i64 },
}

impl PressureSignal {
    /// The signal carried by a registry event, if any
    pub fn from_event(event: &CacheEvent) -> Option<Self> {
        match *event {
            CacheEvent::PressureDetected { ratio } => Some(Self::PressureDetected(ratio)),
            CacheEvent::SystemPressureDetected { ratio } => Some(Self::SystemPressure(ratio)),
            CacheEvent::MemoryLimitExceeded { usage, limit } => {
                Some(Self::LimitExceeded { usage, limit })
            }
            _ => None,
        }
    }
}

/// What [`MemoryOptimizer::handle_signal`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalResponse {
    /// An optimization pass ran and freed this many bytes
    Optimized(i64),
    /// Emergency cleanup ran and freed this many bytes
    EmergencyCleanup(i64),
    /// Nothing to do, or auto-optimization is off
    Ignored,
    /// A pass was already running
    Skipped,
}

struct OptimizerState {
    level: OptimizationLevel,
    auto_optimization: bool,
    predictive: bool,
    interval: Duration,
    stats: MemoryStats,
    /// Miss counters seen by the previous pass, for churn ranking
    last_misses: [i64; 5],
}

struct Timers {
    scheduler: Arc<IntervalScheduler>,
    optimize: TaskId,
    stats: TaskId,
}

/// Clears the busy flag when a pass ends
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cross-cache optimization driver
pub struct MemoryOptimizer {
    registry: Arc<CacheRegistry>,
    state: Mutex<OptimizerState>,
    busy: AtomicBool,
    skipped: AtomicU64,
    clock: Arc<dyn Clock>,
    events: EventBus<OptimizerEvent>,
    listener: Mutex<Option<ListenerId>>,
    timers: Mutex<Option<Timers>>,
}

impl MemoryOptimizer {
    pub fn new(registry: Arc<CacheRegistry>) -> Self {
        Self::with_clock(registry, Arc::new(SystemClock))
    }

    pub fn with_clock(registry: Arc<CacheRegistry>, clock: Arc<dyn Clock>) -> Self {
        let level = OptimizationLevel::default();
        Self {
            registry,
            state: Mutex::new(OptimizerState {
                level,
                auto_optimization: true,
                predictive: true,
                interval: level.interval(),
                stats: MemoryStats::default(),
                last_misses: [0; 5],
            }),
            busy: AtomicBool::new(false),
            skipped: AtomicU64::new(0),
            clock,
            events: EventBus::new(),
            listener: Mutex::new(None),
            timers: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus<OptimizerEvent> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    // ---- settings ----

    /// Change the level; the interval is reset to the level's default
    pub fn set_optimization_level(&self, level: OptimizationLevel) {
        let interval = {
            let mut state = self.state.lock();
            if state.level == level {
                return;
            }
            state.level = level;
            state.interval = level.interval();
            state.interval
        };
        tracing::debug!(?level, interval_s = interval.as_secs(), "optimization level changed");
        self.retune(interval);
    }

    pub fn optimization_level(&self) -> OptimizationLevel {
        self.state.lock().level
    }

    /// Set the pass interval, never below 5 seconds
    pub fn set_optimization_interval(&self, seconds: u64) {
        let interval = Duration::from_secs(seconds).max(MIN_OPTIMIZATION_INTERVAL);
        self.state.lock().interval = interval;
        self.retune(interval);
    }

    pub fn optimization_interval(&self) -> Duration {
        self.state.lock().interval
    }

    pub fn set_auto_optimization_enabled(&self, enabled: bool) {
        self.state.lock().auto_optimization = enabled;
        if let Some(timers) = self.timers.lock().as_ref() {
            if enabled {
                timers.scheduler.resume(timers.optimize);
            } else {
                timers.scheduler.pause(timers.optimize);
            }
        }
    }

    pub fn is_auto_optimization_enabled(&self) -> bool {
        self.state.lock().auto_optimization
    }

    pub fn set_predictive_optimization_enabled(&self, enabled: bool) {
        self.state.lock().predictive = enabled;
    }

    pub fn is_predictive_optimization_enabled(&self) -> bool {
        self.state.lock().predictive
    }

    fn retune(&self, interval: Duration) {
        if let Some(timers) = self.timers.lock().as_ref() {
            timers.scheduler.set_interval(timers.optimize, interval);
        }
    }

    // ---- statistics ----

    pub fn memory_stats(&self) -> MemoryStats {
        self.state.lock().stats
    }

    /// Level observed by the last stats refresh or pressure signal
    pub fn current_pressure_level(&self) -> MemoryPressureLevel {
        self.state.lock().stats.pressure_level
    }

    /// Physical memory not used by this process, `None` when unknown
    pub fn available_system_memory(&self) -> Option<i64> {
        let total = self.registry.system_memory_total()?;
        let used = self.registry.system_memory_usage()?;
        Some(total.saturating_sub(used) as i64)
    }

    /// Hit ratio of the search result cache, 0.0 when it is not registered
    pub fn get_memory_efficiency(&self) -> f64 {
        self.registry
            .cache_stats(CacheKind::SearchResult)
            .map(|stats| stats.hit_ratio)
            .unwrap_or(0.0)
    }

    fn cache_usage(&self, kind: CacheKind) -> i64 {
        self.registry
            .cache_stats(kind)
            .map(|stats| stats.memory_usage)
            .unwrap_or(0)
    }

    /// Refresh the snapshot and emit `StatsUpdated`
    ///
    /// A change of pressure level also emits `PressureChanged`.
    pub fn update_memory_stats(&self) -> MemoryStats {
        let total_memory_usage = self.registry.total_usage();
        let search_cache_memory = self.cache_usage(CacheKind::SearchResult);
        let text_cache_memory = self.cache_usage(CacheKind::PageText);
        let highlight_cache_memory = self.cache_usage(CacheKind::SearchHighlight);
        let system_memory_usage = self.registry.system_memory_usage().unwrap_or(0) as i64;
        let system_memory_total = self.registry.system_memory_total().unwrap_or(0) as i64;
        let memory_pressure = self
            .registry
            .usage_ratio()
            .max(self.registry.system_memory_pressure());
        let pressure_level = MemoryPressureLevel::from_ratio(memory_pressure);

        let (stats, changed) = {
            let mut state = self.state.lock();
            let changed = state.stats.pressure_level != pressure_level;
            state.stats = MemoryStats {
                total_memory_usage,
                search_cache_memory,
                text_cache_memory,
                highlight_cache_memory,
                system_memory_usage,
                system_memory_total,
                memory_pressure,
                pressure_level,
                ..state.stats
            };
            (state.stats, changed)
        };

        if changed {
            self.events.emit(OptimizerEvent::PressureChanged { level: pressure_level });
        }
        self.events.emit(OptimizerEvent::StatsUpdated(stats));
        stats
    }

    // ---- passes ----

    fn begin_pass(&self) -> Option<PassGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| PassGuard(&self.busy))
    }

    /// Whether an optimization pass or emergency cleanup is running
    pub fn is_optimizing(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Signals dropped because a pass was already running
    pub fn skipped_signals(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Run one pass at the current level. Returns bytes freed.
    ///
    /// Returns 0 without doing anything if a pass is already running.
    pub fn optimize_memory_usage(&self) -> i64 {
        let Some(_pass) = self.begin_pass() else {
            tracing::debug!("optimization already running");
            return 0;
        };

        let (level, pressure) = {
            let state = self.state.lock();
            (state.level, state.stats.pressure_level)
        };
        self.events.emit(OptimizerEvent::OptimizationStarted { level });

        let started = std::time::Instant::now();
        let before = self.registry.total_usage();
        self.optimize_for_level(level, pressure);
        let after = self.registry.total_usage();
        let freed = (before - after).max(0);

        {
            let mut state = self.state.lock();
            state.stats.optimization_count += 1;
            state.stats.last_optimization_ms = Some(self.clock.now_ms());
        }

        tracing::debug!(
            freed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ?level,
            "memory optimization pass"
        );
        self.events.emit(OptimizerEvent::OptimizationCompleted { bytes_freed: freed });
        freed
    }

    fn optimize_for_level(&self, level: OptimizationLevel, pressure: MemoryPressureLevel) {
        let registry = &self.registry;
        match level {
            OptimizationLevel::Conservative => {
                if pressure == MemoryPressureLevel::Critical {
                    registry.enforce_limits();
                    registry.handle_memory_pressure();
                }
            }
            OptimizationLevel::Balanced => {
                if pressure >= MemoryPressureLevel::Warning {
                    registry.enforce_limits();
                    registry.analyze_usage_patterns();
                    registry.optimize_distribution();
                    if pressure == MemoryPressureLevel::Critical {
                        self.evict_from_churning(level);
                    }
                }
            }
            OptimizationLevel::Aggressive => {
                registry.analyze_usage_patterns();
                registry.optimize_distribution();
                registry.handle_memory_pressure();
                self.evict_from_churning(level);
                if registry.global_config().enable_compression {
                    registry.compress_inactive_caches();
                }
            }
        }
    }

    /// Kinds ranked by misses since the previous pass, busiest first
    ///
    /// Only registered, non-empty caches are ranked. Ties keep
    /// [`CacheKind::ALL`] order.
    fn churn_ranking(&self) -> Vec<(CacheKind, i64)> {
        let stats = self.registry.all_cache_stats();
        let mut state = self.state.lock();

        let mut ranked: Vec<(CacheKind, i64, i64)> = CacheKind::ALL
            .iter()
            .filter_map(|kind| {
                let (_, s) = stats.iter().find(|(k, _)| k == kind)?;
                let delta = s.total_misses - state.last_misses[kind.index()];
                (s.memory_usage > 0).then_some((*kind, delta, s.memory_usage))
            })
            .collect();
        for (kind, s) in &stats {
            state.last_misses[kind.index()] = s.total_misses;
        }
        drop(state);

        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.into_iter().map(|(kind, _, usage)| (kind, usage)).collect()
    }

    fn evict_from_churning(&self, level: OptimizationLevel) -> i64 {
        let fraction = level.eviction_fraction();
        self.churn_ranking()
            .into_iter()
            .take(level.eviction_breadth())
            .map(|(kind, usage)| self.evict_fraction(kind, usage, fraction))
            .sum()
    }

    fn evict_fraction(&self, kind: CacheKind, usage: i64, fraction: f64) -> i64 {
        let bytes = (usage as f64 * fraction) as i64;
        match self.registry.request_eviction(kind, bytes) {
            Ok(freed) => freed,
            Err(err) => {
                tracing::warn!(kind = %kind, error = %err, "fractional eviction failed");
                0
            }
        }
    }

    fn optimize_kind(&self, kind: CacheKind) -> i64 {
        let usage = self.cache_usage(kind);
        if usage <= 0 {
            return 0;
        }
        self.evict_fraction(kind, usage, TARGETED_EVICTION_FRACTION)
    }

    /// Free 25% of the search result cache
    pub fn optimize_search_caches(&self) -> i64 {
        self.optimize_kind(CacheKind::SearchResult)
    }

    /// Free 25% of the page text cache
    pub fn optimize_text_caches(&self) -> i64 {
        self.optimize_kind(CacheKind::PageText)
    }

    /// Free 25% of the highlight cache
    pub fn optimize_highlight_caches(&self) -> i64 {
        self.optimize_kind(CacheKind::SearchHighlight)
    }

    /// Free half of every registered, non-empty cache regardless of level
    ///
    /// Emits `EmergencyCleanup` with the bytes freed. Returns 0 without
    /// doing anything if a pass is already running.
    pub fn perform_emergency_cleanup(&self) -> i64 {
        let Some(_pass) = self.begin_pass() else {
            return 0;
        };

        let before = self.registry.total_usage();
        for (kind, stats) in self.registry.all_cache_stats() {
            if stats.memory_usage > 0 {
                self.evict_fraction(kind, stats.memory_usage, EMERGENCY_EVICTION_FRACTION);
            }
        }
        let freed = (before - self.registry.total_usage()).max(0);

        tracing::warn!(freed, "emergency cache cleanup");
        self.events.emit(OptimizerEvent::EmergencyCleanup { bytes_freed: freed });
        freed
    }

    /// Advisory recommendations from hit ratios and access patterns
    ///
    /// Each recommendation is also emitted as a `Recommendation` event.
    /// Nothing is applied.
    pub fn analyze_memory_usage_patterns(&self) -> Vec<String> {
        let efficiency = self.get_memory_efficiency();
        let pressure = self.current_pressure_level();
        let mut advice = Vec::new();

        if efficiency < 0.5 {
            advice.push("Consider increasing cache sizes for better hit rates".to_string());
        } else if efficiency > 0.9 && pressure == MemoryPressureLevel::Critical {
            advice.push(
                "High cache efficiency but memory pressure detected - consider reducing cache sizes"
                    .to_string(),
            );
        }

        let policy = self.registry.policy();
        policy.analyze_access_patterns();
        let recommended = policy.recommend_strategy();
        let current = policy.strategy();
        if recommended != current {
            advice.push(format!(
                "Access patterns favour the {} eviction strategy (currently {})",
                recommended, current
            ));
        }

        for text in &advice {
            self.events.emit(OptimizerEvent::Recommendation(text.clone()));
        }
        advice
    }

    /// One periodic tick: a pass if auto-optimization is on, then advisory
    /// analysis if predictive optimization is on
    pub fn perform_periodic_optimization(&self) {
        let (auto, predictive) = {
            let state = self.state.lock();
            (state.auto_optimization, state.predictive)
        };
        if !auto {
            return;
        }
        self.optimize_memory_usage();
        if predictive {
            self.analyze_memory_usage_patterns();
        }
    }

    // ---- signals ----

    /// React to a registry signal
    ///
    /// - `PressureDetected`: records the new level (emitting
    ///   `PressureChanged`); at Warning or above runs a pass.
    /// - `SystemPressure`: above 0.90 runs emergency cleanup.
    /// - `LimitExceeded`: runs a pass.
    ///
    /// Passes run only with auto-optimization on. A signal arriving while a
    /// pass is running, including one raised by the pass itself, is skipped.
    pub fn handle_signal(&self, signal: PressureSignal) -> SignalResponse {
        if self.is_optimizing() {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(?signal, "signal skipped during optimization");
            return SignalResponse::Skipped;
        }
        let auto = self.is_auto_optimization_enabled();

        match signal {
            PressureSignal::PressureDetected(ratio) => {
                let level = MemoryPressureLevel::from_ratio(ratio);
                let changed = {
                    let mut state = self.state.lock();
                    let changed = state.stats.pressure_level != level;
                    state.stats.pressure_level = level;
                    state.stats.memory_pressure = ratio;
                    changed
                };
                if !changed {
                    return SignalResponse::Ignored;
                }
                self.events.emit(OptimizerEvent::PressureChanged { level });
                if auto && level >= MemoryPressureLevel::Warning {
                    SignalResponse::Optimized(self.optimize_memory_usage())
                } else {
                    SignalResponse::Ignored
                }
            }
            PressureSignal::SystemPressure(ratio) => {
                if auto && ratio > EMERGENCY_SYSTEM_RATIO {
                    SignalResponse::EmergencyCleanup(self.perform_emergency_cleanup())
                } else {
                    SignalResponse::Ignored
                }
            }
            PressureSignal::LimitExceeded { .. } => {
                if auto {
                    SignalResponse::Optimized(self.optimize_memory_usage())
                } else {
                    SignalResponse::Ignored
                }
            }
        }
    }

    /// Subscribe to the registry's events. Calling this twice is a no-op.
    ///
    /// The listener holds a weak handle to the optimizer.
    pub fn attach(self: &Arc<Self>) {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let id = self.registry.events().listen(move |event| {
            let Some(signal) = PressureSignal::from_event(event) else {
                return;
            };
            if let Some(optimizer) = weak.upgrade() {
                optimizer.handle_signal(signal);
            }
        });
        *listener = Some(id);
    }

    /// Stop reacting to registry events
    pub fn detach(&self) {
        if let Some(id) = self.listener.lock().take() {
            self.registry.events().unlisten(id);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.listener.lock().is_some()
    }

    // ---- timers ----

    /// Arm the periodic pass and the 5 s stats refresh on `scheduler`
    pub fn start_timers(self: &Arc<Self>, scheduler: &Arc<IntervalScheduler>) {
        let mut timers = self.timers.lock();
        if timers.is_some() {
            return;
        }
        let (interval, auto) = {
            let state = self.state.lock();
            (state.interval, state.auto_optimization)
        };

        let weak = Arc::downgrade(self);
        let optimize = scheduler.schedule("memory-optimize", interval, move || {
            if let Some(optimizer) = weak.upgrade() {
                optimizer.perform_periodic_optimization();
            }
        });
        let weak = Arc::downgrade(self);
        let stats = scheduler.schedule("memory-stats", STATS_INTERVAL, move || {
            if let Some(optimizer) = weak.upgrade() {
                optimizer.update_memory_stats();
            }
        });
        if !auto {
            scheduler.pause(optimize);
        }

        *timers = Some(Timers {
            scheduler: scheduler.clone(),
            optimize,
            stats,
        });
    }

    /// Cancel the periodic loops. Idempotent.
    pub fn stop_timers(&self) {
        if let Some(timers) = self.timers.lock().take() {
            timers.scheduler.cancel(timers.optimize);
            timers.scheduler.cancel(timers.stats);
        }
    }

    pub fn timers_running(&self) -> bool {
        self.timers.lock().is_some()
    }
}

impl Drop for MemoryOptimizer {
    fn drop(&mut self) {
        self.stop_timers();
        self.detach();
    }
}
