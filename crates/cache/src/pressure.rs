//! Memory pressure classification
//!
//! Two separate notions live here. [`MemoryPressureLevel`] is a fixed mapping
//! from a usage ratio to a severity, used to decide how hard to evict.
//! [`PressureThresholds`] are the configurable warning/critical ratios the
//! registry reports against.

use serde::{Deserialize, Serialize};

/// Ratio at which pressure becomes [`MemoryPressureLevel::Warning`]
pub const WARNING_RATIO: f64 = 0.70;

/// Ratio at which pressure becomes [`MemoryPressureLevel::Critical`]
pub const CRITICAL_RATIO: f64 = 0.85;

/// Gap kept between the warning and critical thresholds when clamping
pub const THRESHOLD_GAP: f64 = 0.05;

/// Severity of memory pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryPressureLevel {
    /// Usage below 70%
    Normal,
    /// Usage from 70% up to 85%
    Warning,
    /// Usage at or above 85%
    Critical,
}

impl MemoryPressureLevel {
    /// Classify a usage ratio (used / limit)
    ///
    /// Non-decreasing in `ratio`. NaN is treated as no pressure.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio.is_nan() || ratio < WARNING_RATIO {
            MemoryPressureLevel::Normal
        } else if ratio < CRITICAL_RATIO {
            MemoryPressureLevel::Warning
        } else {
            MemoryPressureLevel::Critical
        }
    }

    /// Returns true at Warning or above
    pub fn needs_eviction(&self) -> bool {
        *self >= MemoryPressureLevel::Warning
    }
}

/// Configurable warning/critical ratios
///
/// Always satisfies `0.0 <= warning < critical <= 1.0`. Out-of-range or
/// inverted input is clamped rather than rejected: both values are clamped
/// into `[0, 1]`, then if `warning >= critical` the critical ratio is raised to
/// `warning + 0.05` (capped at 1.0), and if that still leaves no gap the
/// warning ratio is lowered to `critical - 0.05`.
///
/// ```
/// use pdf_reader_cache::PressureThresholds;
///
/// let t = PressureThresholds::new(0.6, 0.5);
/// assert_eq!(t.warning(), 0.6);
/// assert!((t.critical() - 0.65).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureThresholds {
    warning: f64,
    critical: f64,
}

impl PressureThresholds {
    /// Create thresholds, clamping as described on the type
    pub fn new(warning: f64, critical: f64) -> Self {
        let (warning, critical, _) = Self::clamp(warning, critical);
        Self { warning, critical }
    }

    /// Clamp a pair, also reporting whether anything had to change
    pub fn clamp(warning: f64, critical: f64) -> (f64, f64, bool) {
        let sanitize = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        let mut w = sanitize(warning);
        let mut c = sanitize(critical);

        if w >= c {
            c = (w + THRESHOLD_GAP).min(1.0);
            if w >= c {
                w = c - THRESHOLD_GAP;
            }
        }

        let adjusted = w != warning || c != critical;
        (w, c, adjusted)
    }

    pub fn warning(&self) -> f64 {
        self.warning
    }

    pub fn critical(&self) -> f64 {
        self.critical
    }

    /// Classify a ratio against these thresholds
    pub fn level(&self, ratio: f64) -> MemoryPressureLevel {
        if ratio >= self.critical {
            MemoryPressureLevel::Critical
        } else if ratio >= self.warning {
            MemoryPressureLevel::Warning
        } else {
            MemoryPressureLevel::Normal
        }
    }
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            warning: 0.75,
            critical: 0.90,
        }
    }
}
