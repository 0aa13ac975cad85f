//! Self-tuning eviction scoring
//!
//! [`EvictionPolicy`] keeps an access history per item id and ranks eviction
//! candidates with one of four formulas (see [`EvictionStrategy`]). Lower
//! scores are evicted first.
//!
//! The policy also watches its own track record. Every eviction leaves a
//! short-lived "ghost" of the item; if the item is requested again while the
//! ghost is alive the eviction was a misprediction, and if the ghost expires
//! untouched it was a correct one. Per-strategy accuracy feeds
//! [`EvictionPolicy::update_eviction_strategy`].
//!
//! Lock order: the policy lock is innermost. Nothing here calls out to a cache
//! or the registry while holding it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::events::EventBus;
use crate::types::EvictionStrategy;

/// Accesses needed before an item counts as frequent
pub const FREQUENT_ACCESS_COUNT: u32 = 5;

/// Average interval under which a well-used item counts as frequent
pub const FREQUENT_INTERVAL_MS: f64 = 60_000.0;

/// Window used by burst detection
pub const BURST_WINDOW_MS: i64 = 10_000;

/// How long an evicted item is watched for re-access
pub const GHOST_TTL_MS: i64 = 60_000;

/// Minimum resolved predictions before a strategy's accuracy is trusted
pub const MIN_STRATEGY_SAMPLES: u64 = 10;

/// Accuracy margin an alternate strategy must beat the current one by
pub const STRATEGY_SWITCH_MARGIN: f64 = 0.1;

const MAX_GHOSTS: usize = 4096;

/// Access histories kept before the least recently used is dropped
pub const MAX_TRACKED_ITEMS: usize = 16_384;

/// Access history of one item
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccessInfo {
    pub last_access_ms: i64,
    pub access_count: u32,
    pub first_access_ms: i64,
    /// Running average of the gap between accesses, 0 until the second access
    pub average_interval_ms: f64,
    pub is_frequent: bool,
}

impl AccessInfo {
    fn first(now: i64) -> Self {
        Self {
            last_access_ms: now,
            access_count: 1,
            first_access_ms: now,
            average_interval_ms: 0.0,
            is_frequent: false,
        }
    }

    fn touch(&mut self, now: i64) {
        let interval = (now - self.last_access_ms).max(0) as f64;
        self.access_count = self.access_count.saturating_add(1);
        self.average_interval_ms = if self.average_interval_ms == 0.0 {
            interval
        } else {
            (self.average_interval_ms + interval) / 2.0
        };
        self.last_access_ms = now;
        self.is_frequent = self.access_count >= FREQUENT_ACCESS_COUNT
            && self.average_interval_ms < FREQUENT_INTERVAL_MS;
    }
}

/// Class of access pattern found by [`EvictionPolicy::analyze_access_patterns`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    /// Accesses arrive at a steady rhythm
    Sequential,
    /// Most items were touched within the burst window
    Burst,
}

impl PatternKind {
    pub fn name(&self) -> &'static str {
        match self {
            PatternKind::Sequential => "sequential",
            PatternKind::Burst => "burst",
        }
    }
}

/// A detected pattern with its confidence (0.0 to 1.0)
#[derive(Debug, Clone, PartialEq)]
pub struct AccessPattern {
    pub kind: PatternKind,
    pub confidence: f64,
    pub detected_at_ms: i64,
    /// Mean gap for sequential patterns, window length for bursts
    pub interval_ms: i64,
    /// Items contributing to the pattern
    pub samples: usize,
}

/// Prediction record of one strategy
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StrategyStats {
    pub evictions_performed: u64,
    pub correct_predictions: u64,
    pub total_predictions: u64,
}

impl StrategyStats {
    /// Correct share of resolved predictions, 0.0 with none
    pub fn accuracy(&self) -> f64 {
        if self.total_predictions == 0 {
            0.0
        } else {
            self.correct_predictions as f64 / self.total_predictions as f64
        }
    }
}

/// Events published by the policy
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    StrategyChanged(EvictionStrategy),
    PatternDetected(AccessPattern),
    Recommendation(String),
}

#[derive(Debug, Clone, Copy)]
struct Ghost {
    strategy: EvictionStrategy,
    evicted_at_ms: i64,
}

struct PolicyState {
    strategy: EvictionStrategy,
    adaptive_threshold: f64,
    history: HashMap<String, AccessInfo>,
    patterns: Vec<AccessPattern>,
    stats: HashMap<EvictionStrategy, StrategyStats>,
    /// Selected by `select_for_eviction` but not yet reported evicted
    pending: HashMap<String, (EvictionStrategy, i64)>,
    ghosts: HashMap<String, Ghost>,
}

impl PolicyState {
    fn new() -> Self {
        Self {
            strategy: EvictionStrategy::Lru,
            adaptive_threshold: 0.75,
            history: HashMap::new(),
            patterns: Vec::new(),
            stats: HashMap::new(),
            pending: HashMap::new(),
            ghosts: HashMap::new(),
        }
    }

    fn score(&self, item_id: &str, strategy: EvictionStrategy, now: i64) -> f64 {
        let Some(info) = self.history.get(item_id) else {
            return 0.0;
        };

        let elapsed = (now - info.last_access_ms).max(0) as f64;
        let recency = 1.0 / (1.0 + elapsed / 1000.0);
        let frequency = info.access_count as f64;
        let pattern = if info.is_frequent
            && info.average_interval_ms > 0.0
            && elapsed < info.average_interval_ms * 1.5
        {
            1.0
        } else {
            0.5
        };

        match strategy {
            EvictionStrategy::Lru => recency,
            EvictionStrategy::Lfu => frequency,
            EvictionStrategy::Adaptive => 0.4 * recency + 0.3 * frequency + 0.3 * pattern,
            EvictionStrategy::Predictive => (recency + frequency / 10.0 + pattern) / 3.0,
        }
    }

    /// Resolve ghosts older than the watch window as correct predictions
    fn retire_ghosts(&mut self, now: i64) {
        let expired: Vec<String> = self
            .ghosts
            .iter()
            .filter(|(_, g)| now - g.evicted_at_ms >= GHOST_TTL_MS)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(ghost) = self.ghosts.remove(&id) {
                let stats = self.stats.entry(ghost.strategy).or_default();
                stats.total_predictions += 1;
                stats.correct_predictions += 1;
            }
        }
        self.pending
            .retain(|_, (_, selected_at)| now - *selected_at < GHOST_TTL_MS);
    }

    fn cap_history(&mut self) {
        while self.history.len() > MAX_TRACKED_ITEMS {
            let oldest = self
                .history
                .iter()
                .min_by_key(|(_, info)| info.last_access_ms)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.history.remove(&id);
                }
                None => break,
            }
        }
    }

    /// Candidates ordered lowest score first; ties keep input order
    fn rank<'a>(&self, candidates: &[&'a str], strategy: EvictionStrategy, now: i64) -> Vec<&'a str> {
        let mut scored: Vec<(&str, f64)> = candidates
            .iter()
            .map(|id| (*id, self.score(id, strategy, now)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.into_iter().map(|(id, _)| id).collect()
    }

    fn cap_ghosts(&mut self) {
        while self.ghosts.len() > MAX_GHOSTS {
            let oldest = self
                .ghosts
                .iter()
                .min_by_key(|(_, g)| g.evicted_at_ms)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.ghosts.remove(&id);
                }
                None => break,
            }
        }
    }
}

/// Access tracker and eviction ranker
///
/// # Example
///
/// ```
/// use pdf_reader_cache::{EvictionPolicy, EvictionStrategy};
///
/// let policy = EvictionPolicy::new();
/// policy.set_strategy(EvictionStrategy::Lfu);
///
/// policy.record_access("doc1_page3");
/// policy.record_access("doc1_page3");
/// policy.record_access("doc1_page4");
///
/// let victims = policy.select_for_eviction(&["doc1_page3", "doc1_page4"], 1);
/// assert_eq!(victims, vec!["doc1_page4".to_string()]);
/// ```
pub struct EvictionPolicy {
    state: Mutex<PolicyState>,
    clock: Arc<dyn Clock>,
    events: EventBus<PolicyEvent>,
}

impl EvictionPolicy {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a policy reading time from `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(PolicyState::new()),
            clock,
            events: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus<PolicyEvent> {
        &self.events
    }

    /// Record an access to `item_id`
    ///
    /// Re-access of a recently evicted item is counted against the strategy
    /// that evicted it.
    pub fn record_access(&self, item_id: &str) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        if let Some(ghost) = state.ghosts.remove(item_id) {
            state.stats.entry(ghost.strategy).or_default().total_predictions += 1;
            tracing::trace!(item = item_id, strategy = %ghost.strategy, "eviction mispredicted");
        }

        state
            .history
            .entry(item_id.to_string())
            .and_modify(|info| info.touch(now))
            .or_insert_with(|| AccessInfo::first(now));
        state.cap_history();
    }

    /// Forget the history of an evicted item
    pub fn record_eviction(&self, item_id: &str) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        state.history.remove(item_id);
        let strategy = state
            .pending
            .remove(item_id)
            .map(|(strategy, _)| strategy)
            .unwrap_or(state.strategy);
        state.stats.entry(strategy).or_default().evictions_performed += 1;
        state.ghosts.insert(
            item_id.to_string(),
            Ghost {
                strategy,
                evicted_at_ms: now,
            },
        );
        state.cap_ghosts();
    }

    /// Drop everything known about an item removed outside eviction
    ///
    /// Unlike [`record_eviction`](Self::record_eviction) this leaves no ghost
    /// and counts nothing against a strategy.
    pub fn forget(&self, item_id: &str) {
        let mut state = self.state.lock();
        state.history.remove(item_id);
        state.pending.remove(item_id);
        state.ghosts.remove(item_id);
    }

    /// Feed a prediction outcome observed by the caller
    pub fn record_prediction_outcome(&self, strategy: EvictionStrategy, correct: bool) {
        let mut state = self.state.lock();
        let stats = state.stats.entry(strategy).or_default();
        stats.total_predictions += 1;
        if correct {
            stats.correct_predictions += 1;
        }
    }

    pub fn set_strategy(&self, strategy: EvictionStrategy) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.strategy != strategy;
            state.strategy = strategy;
            changed
        };
        if changed {
            tracing::debug!(strategy = %strategy, "eviction strategy changed");
            self.events.emit(PolicyEvent::StrategyChanged(strategy));
        }
    }

    pub fn strategy(&self) -> EvictionStrategy {
        self.state.lock().strategy
    }

    /// Set the score below which [`should_evict`](Self::should_evict) answers
    /// yes, clamped into `[0, 1]`
    pub fn set_adaptive_threshold(&self, threshold: f64) {
        let threshold = if threshold.is_nan() {
            0.0
        } else {
            threshold.clamp(0.0, 1.0)
        };
        self.state.lock().adaptive_threshold = threshold;
    }

    pub fn adaptive_threshold(&self) -> f64 {
        self.state.lock().adaptive_threshold
    }

    /// Score an item under `strategy`; unseen items score 0
    pub fn score(&self, item_id: &str, strategy: EvictionStrategy) -> f64 {
        let now = self.clock.now_ms();
        self.state.lock().score(item_id, strategy, now)
    }

    /// Order every candidate for eviction, lowest score first, without
    /// recording any prediction
    ///
    /// Callers that evict a prefix of the order report each victim through
    /// [`record_eviction`](Self::record_eviction).
    pub fn rank_for_eviction<S: AsRef<str>>(&self, candidates: &[S]) -> Vec<String> {
        let ids: Vec<&str> = candidates.iter().map(AsRef::as_ref).collect();
        let now = self.clock.now_ms();
        let state = self.state.lock();
        let order = state.rank(&ids, state.strategy, now);
        order.into_iter().map(str::to_string).collect()
    }

    /// Pick up to `target_count` candidates to evict, lowest score first
    ///
    /// Equal scores keep their input order. The chosen ids are remembered as
    /// predictions of the active strategy.
    pub fn select_for_eviction<S: AsRef<str>>(
        &self,
        candidates: &[S],
        target_count: usize,
    ) -> Vec<String> {
        if candidates.is_empty() || target_count == 0 {
            return Vec::new();
        }

        let ids: Vec<&str> = candidates.iter().map(AsRef::as_ref).collect();
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let strategy = state.strategy;

        let selected: Vec<String> = state
            .rank(&ids, strategy, now)
            .into_iter()
            .take(target_count)
            .map(str::to_string)
            .collect();

        for id in &selected {
            state.pending.insert(id.clone(), (strategy, now));
        }
        selected
    }

    /// Seed the history with externally known facts and decide whether the
    /// item scores below the adaptive threshold
    pub fn should_evict(&self, item_id: &str, last_access_ms: i64, access_count: u32) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        state
            .history
            .entry(item_id.to_string())
            .and_modify(|info| {
                info.last_access_ms = last_access_ms;
                info.access_count = access_count;
            })
            .or_insert(AccessInfo {
                last_access_ms,
                access_count,
                first_access_ms: last_access_ms,
                average_interval_ms: 0.0,
                is_frequent: access_count >= FREQUENT_ACCESS_COUNT,
            });
        state.cap_history();

        let strategy = state.strategy;
        state.score(item_id, strategy, now) < state.adaptive_threshold
    }

    /// Detect sequential and burst access over all tracked items
    ///
    /// Sequential: sorting last-access times, at least 70% of the gaps lie
    /// within 30% of the mean gap. Burst: at least half of the tracked items
    /// were accessed within the last 10 s. Replaces the previously detected
    /// patterns.
    pub fn analyze_access_patterns(&self) -> Vec<AccessPattern> {
        let now = self.clock.now_ms();
        let patterns = {
            let mut state = self.state.lock();
            state.retire_ghosts(now);
            let patterns = detect_patterns(&state.history, now);
            state.patterns = patterns.clone();
            patterns
        };

        for pattern in &patterns {
            tracing::debug!(
                pattern = pattern.kind.name(),
                confidence = pattern.confidence,
                "access pattern detected"
            );
            self.events.emit(PolicyEvent::PatternDetected(pattern.clone()));
        }
        patterns
    }

    /// Patterns found by the last analysis
    pub fn detected_patterns(&self) -> Vec<AccessPattern> {
        self.state.lock().patterns.clone()
    }

    /// Strategy suited to the most confident detected pattern
    ///
    /// Advisory only; nothing is switched.
    pub fn recommend_strategy(&self) -> EvictionStrategy {
        let state = self.state.lock();
        let mut dominant: Option<&AccessPattern> = None;
        for pattern in &state.patterns {
            if dominant.map_or(true, |d| pattern.confidence > d.confidence) {
                dominant = Some(pattern);
            }
        }

        match dominant.map(|p| p.kind) {
            Some(PatternKind::Sequential) => EvictionStrategy::Predictive,
            Some(PatternKind::Burst) => EvictionStrategy::Lfu,
            None => EvictionStrategy::Lru,
        }
    }

    /// Switch to the most accurate strategy if it clearly beats the current
    /// one. Returns the new strategy when a switch happened.
    pub fn update_eviction_strategy(&self) -> Option<EvictionStrategy> {
        let now = self.clock.now_ms();
        let (best, best_accuracy) = {
            let mut state = self.state.lock();
            state.retire_ghosts(now);

            let current = state.strategy;
            let current_accuracy = state
                .stats
                .get(&current)
                .map(StrategyStats::accuracy)
                .unwrap_or(0.0);

            let mut best = current;
            let mut best_accuracy = current_accuracy;
            for strategy in EvictionStrategy::ALL {
                let Some(stats) = state.stats.get(&strategy) else {
                    continue;
                };
                if stats.total_predictions >= MIN_STRATEGY_SAMPLES
                    && stats.accuracy() > best_accuracy
                {
                    best = strategy;
                    best_accuracy = stats.accuracy();
                }
            }

            if best == current || best_accuracy <= current_accuracy + STRATEGY_SWITCH_MARGIN {
                return None;
            }
            (best, best_accuracy)
        };

        self.set_strategy(best);
        self.events.emit(PolicyEvent::Recommendation(format!(
            "Switched to {} strategy (accuracy: {:.2})",
            best, best_accuracy
        )));
        Some(best)
    }

    pub fn strategy_stats(&self, strategy: EvictionStrategy) -> StrategyStats {
        self.state
            .lock()
            .stats
            .get(&strategy)
            .copied()
            .unwrap_or_default()
    }

    pub fn access_info(&self, item_id: &str) -> Option<AccessInfo> {
        self.state.lock().history.get(item_id).copied()
    }

    /// Number of items with access history
    pub fn tracked_items(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Drop all history, patterns, pending predictions and statistics
    ///
    /// The active strategy and threshold are kept.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.patterns.clear();
        state.stats.clear();
        state.pending.clear();
        state.ghosts.clear();
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn detect_patterns(history: &HashMap<String, AccessInfo>, now: i64) -> Vec<AccessPattern> {
    let mut patterns = Vec::new();
    if history.is_empty() {
        return patterns;
    }

    let mut times: Vec<i64> = history.values().map(|i| i.last_access_ms).collect();
    times.sort_unstable();

    if times.len() > 1 {
        let gaps: Vec<i64> = times.windows(2).map(|w| w[1] - w[0]).collect();
        let mean = gaps.iter().sum::<i64>() as f64 / gaps.len() as f64;
        let tolerance = mean * 0.3;
        let consistent = gaps
            .iter()
            .filter(|&&gap| (gap as f64 - mean).abs() < tolerance)
            .count();

        if consistent as f64 >= gaps.len() as f64 * 0.7 {
            patterns.push(AccessPattern {
                kind: PatternKind::Sequential,
                confidence: consistent as f64 / gaps.len() as f64,
                detected_at_ms: now,
                interval_ms: mean.round() as i64,
                samples: consistent,
            });
        }
    }

    let recent = history
        .values()
        .filter(|i| now - i.last_access_ms < BURST_WINDOW_MS)
        .count();
    if recent as f64 >= history.len() as f64 * 0.5 {
        patterns.push(AccessPattern {
            kind: PatternKind::Burst,
            confidence: recent as f64 / history.len() as f64,
            detected_at_ms: now,
            interval_ms: BURST_WINDOW_MS,
            samples: recent,
        });
    }

    patterns
}
