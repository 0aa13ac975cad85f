//! Cache engine configuration.
//!
//! [`GlobalConfig`] carries every tunable of the engine: per-kind and total
//! byte limits, pressure thresholds, timer intervals and feature toggles.
//! Persistence belongs to the application; this module only reads plain
//! key/value pairs, which may come from any store, from environment variables,
//! or from a simple `key = value` file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, ConfigError};
use crate::pressure::PressureThresholds;
use crate::types::CacheKind;

const MB: i64 = 1024 * 1024;

/// Prefix of the environment variables read by [`GlobalConfig::from_env`]
pub const ENV_PREFIX: &str = "PDF_READER_CACHE_";

/// Configuration for the cache engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Budget shared by all caches, in bytes
    pub max_total_memory: i64,
    /// Search result cache limit in bytes
    pub search_result_cache_limit: i64,
    /// Page text cache limit in bytes
    pub page_text_cache_limit: i64,
    /// Search highlight cache limit in bytes
    pub search_highlight_cache_limit: i64,
    /// Rendered page cache limit in bytes
    pub pdf_render_cache_limit: i64,
    /// Thumbnail cache limit in bytes
    pub thumbnail_cache_limit: i64,

    /// Period of the cleanup loop in milliseconds
    pub cleanup_interval_ms: u64,
    /// Usage ratio reported as a pressure warning
    pub warning_threshold: f64,
    /// Usage ratio reported as critical pressure
    pub critical_threshold: f64,

    /// Period of the system memory probe in milliseconds
    pub system_memory_check_interval_ms: u64,
    /// System memory ratio above which caches are shed
    pub system_memory_threshold: f64,

    pub enable_lru_eviction: bool,
    pub enable_memory_pressure_eviction: bool,
    pub enable_adaptive_management: bool,
    pub enable_predictive_eviction: bool,
    pub enable_compression: bool,
    pub enable_emergency_eviction: bool,
    pub enable_system_memory_monitoring: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_total_memory: 512 * MB,
            search_result_cache_limit: 100 * MB,
            page_text_cache_limit: 50 * MB,
            search_highlight_cache_limit: 25 * MB,
            pdf_render_cache_limit: 256 * MB,
            thumbnail_cache_limit: 81 * MB,
            cleanup_interval_ms: 30_000,
            warning_threshold: 0.75,
            critical_threshold: 0.90,
            system_memory_check_interval_ms: 10_000,
            system_memory_threshold: 0.85,
            enable_lru_eviction: true,
            enable_memory_pressure_eviction: true,
            enable_adaptive_management: true,
            enable_predictive_eviction: true,
            enable_compression: false,
            enable_emergency_eviction: true,
            enable_system_memory_monitoring: true,
        }
    }
}

impl GlobalConfig {
    /// Byte limit configured for a kind
    pub fn limit_for(&self, kind: CacheKind) -> i64 {
        match kind {
            CacheKind::SearchResult => self.search_result_cache_limit,
            CacheKind::PageText => self.page_text_cache_limit,
            CacheKind::SearchHighlight => self.search_highlight_cache_limit,
            CacheKind::PdfRender => self.pdf_render_cache_limit,
            CacheKind::Thumbnail => self.thumbnail_cache_limit,
        }
    }

    /// Set the byte limit for a kind
    pub fn set_limit_for(&mut self, kind: CacheKind, bytes: i64) {
        let bytes = bytes.max(0);
        match kind {
            CacheKind::SearchResult => self.search_result_cache_limit = bytes,
            CacheKind::PageText => self.page_text_cache_limit = bytes,
            CacheKind::SearchHighlight => self.search_highlight_cache_limit = bytes,
            CacheKind::PdfRender => self.pdf_render_cache_limit = bytes,
            CacheKind::Thumbnail => self.thumbnail_cache_limit = bytes,
        }
    }

    /// Sets the total budget in megabytes.
    pub fn with_total_mb(mut self, mb: i64) -> Self {
        self.max_total_memory = mb.max(0) * MB;
        self
    }

    /// Sets one kind's limit in megabytes.
    pub fn with_limit_mb(mut self, kind: CacheKind, mb: i64) -> Self {
        self.set_limit_for(kind, mb * MB);
        self
    }

    /// Sets the pressure thresholds, clamped into a valid pair.
    pub fn with_thresholds(mut self, warning: f64, critical: f64) -> Self {
        let thresholds = PressureThresholds::new(warning, critical);
        self.warning_threshold = thresholds.warning();
        self.critical_threshold = thresholds.critical();
        self
    }

    /// Pressure thresholds after clamping
    pub fn thresholds(&self) -> PressureThresholds {
        PressureThresholds::new(self.warning_threshold, self.critical_threshold)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn system_memory_check_interval(&self) -> Duration {
        Duration::from_millis(self.system_memory_check_interval_ms)
    }

    /// Report thresholds that would need clamping.
    ///
    /// Setters clamp silently; this lets a caller tell the user their
    /// configuration was not taken as written.
    pub fn validate(&self) -> Result<(), CacheError> {
        let (_, _, adjusted) =
            PressureThresholds::clamp(self.warning_threshold, self.critical_threshold);
        let system_ok = (0.0..=1.0).contains(&self.system_memory_threshold);
        if adjusted || !system_ok {
            return Err(CacheError::InvalidThreshold {
                warning: self.warning_threshold,
                critical: self.critical_threshold,
            });
        }
        Ok(())
    }

    /// Builds a configuration from key/value pairs, starting from defaults.
    ///
    /// Recognised keys (unknown keys are ignored):
    /// - `max_total_memory_bytes`, `search_result_cache_bytes`,
    ///   `page_text_cache_bytes`, `search_highlight_cache_bytes`,
    ///   `pdf_render_cache_bytes`, `thumbnail_cache_bytes`
    /// - the same limits in whole megabytes: `max_total_memory_mb`,
    ///   `search_result_cache_mb`, `page_text_cache_mb`,
    ///   `search_highlight_cache_mb`, `pdf_render_cache_mb`, `thumbnail_cache_mb`
    /// - `cleanup_interval_ms`, `system_memory_check_interval_ms`
    /// - `warning_threshold`, `critical_threshold`, `system_memory_threshold`
    /// - `enable_lru_eviction`, `enable_memory_pressure_eviction`,
    ///   `enable_adaptive_management`, `enable_predictive_eviction`,
    ///   `enable_compression`, `enable_emergency_eviction`,
    ///   `enable_system_memory_monitoring`
    ///
    /// # Errors
    /// Returns an error if a recognised key carries an unparsable value.
    pub fn from_key_values<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.apply(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Apply a single key/value pair. Returns whether the key was recognised.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        let key = key.trim();
        let value = value.trim().trim_matches('"');

        match key {
            "max_total_memory_mb" => self.max_total_memory = parse_mb(key, value)?,
            "search_result_cache_mb" => self.search_result_cache_limit = parse_mb(key, value)?,
            "page_text_cache_mb" => self.page_text_cache_limit = parse_mb(key, value)?,
            "search_highlight_cache_mb" => {
                self.search_highlight_cache_limit = parse_mb(key, value)?
            }
            "pdf_render_cache_mb" => self.pdf_render_cache_limit = parse_mb(key, value)?,
            "thumbnail_cache_mb" => self.thumbnail_cache_limit = parse_mb(key, value)?,
            "max_total_memory_bytes" => self.max_total_memory = parse_bytes(key, value)?,
            "search_result_cache_bytes" => {
                self.search_result_cache_limit = parse_bytes(key, value)?
            }
            "page_text_cache_bytes" => self.page_text_cache_limit = parse_bytes(key, value)?,
            "search_highlight_cache_bytes" => {
                self.search_highlight_cache_limit = parse_bytes(key, value)?
            }
            "pdf_render_cache_bytes" => self.pdf_render_cache_limit = parse_bytes(key, value)?,
            "thumbnail_cache_bytes" => self.thumbnail_cache_limit = parse_bytes(key, value)?,
            "cleanup_interval_ms" => self.cleanup_interval_ms = parse(key, value)?,
            "system_memory_check_interval_ms" => {
                self.system_memory_check_interval_ms = parse(key, value)?
            }
            "warning_threshold" => self.warning_threshold = parse(key, value)?,
            "critical_threshold" => self.critical_threshold = parse(key, value)?,
            "system_memory_threshold" => self.system_memory_threshold = parse(key, value)?,
            "enable_lru_eviction" => self.enable_lru_eviction = parse_bool(key, value)?,
            "enable_memory_pressure_eviction" => {
                self.enable_memory_pressure_eviction = parse_bool(key, value)?
            }
            "enable_adaptive_management" => {
                self.enable_adaptive_management = parse_bool(key, value)?
            }
            "enable_predictive_eviction" => {
                self.enable_predictive_eviction = parse_bool(key, value)?
            }
            "enable_compression" => self.enable_compression = parse_bool(key, value)?,
            "enable_emergency_eviction" => {
                self.enable_emergency_eviction = parse_bool(key, value)?
            }
            "enable_system_memory_monitoring" => {
                self.enable_system_memory_monitoring = parse_bool(key, value)?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Loads configuration from environment variables.
    ///
    /// Each key accepted by [`from_key_values`](Self::from_key_values) is read
    /// from `PDF_READER_CACHE_<KEY>` with the key upper-cased, for example
    /// `PDF_READER_CACHE_MAX_TOTAL_MEMORY_MB=1024`.
    ///
    /// # Errors
    /// Returns an error if any variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for key in KEYS {
            let var = format!("{}{}", ENV_PREFIX, key.to_ascii_uppercase());
            if let Ok(value) = std::env::var(&var) {
                config.apply(key, &value).map_err(|_| ConfigError::invalid(&var, &value))?;
            }
        }
        Ok(config)
    }

    /// Loads configuration from a `key = value` file.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a value is invalid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::parse(&contents)
    }

    /// Parses `key = value` text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let pairs = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='));
        Self::from_key_values(pairs)
    }

    /// Writes the configuration as `key = value` lines.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_key_value_text())?;
        Ok(())
    }

    fn to_key_value_text(&self) -> String {
        let mut out = String::from("# PDF Reader Cache Configuration\n");
        for (key, value) in self.to_key_values() {
            out.push_str(&format!("{} = {}\n", key, value));
        }
        out
    }

    /// Every setting with its current value; limits are written in bytes
    pub fn to_key_values(&self) -> Vec<(&'static str, String)> {
        vec![
            ("max_total_memory_bytes", self.max_total_memory.to_string()),
            ("search_result_cache_bytes", self.search_result_cache_limit.to_string()),
            ("page_text_cache_bytes", self.page_text_cache_limit.to_string()),
            (
                "search_highlight_cache_bytes",
                self.search_highlight_cache_limit.to_string(),
            ),
            ("pdf_render_cache_bytes", self.pdf_render_cache_limit.to_string()),
            ("thumbnail_cache_bytes", self.thumbnail_cache_limit.to_string()),
            ("cleanup_interval_ms", self.cleanup_interval_ms.to_string()),
            (
                "system_memory_check_interval_ms",
                self.system_memory_check_interval_ms.to_string(),
            ),
            ("warning_threshold", self.warning_threshold.to_string()),
            ("critical_threshold", self.critical_threshold.to_string()),
            ("system_memory_threshold", self.system_memory_threshold.to_string()),
            ("enable_lru_eviction", self.enable_lru_eviction.to_string()),
            (
                "enable_memory_pressure_eviction",
                self.enable_memory_pressure_eviction.to_string(),
            ),
            ("enable_adaptive_management", self.enable_adaptive_management.to_string()),
            ("enable_predictive_eviction", self.enable_predictive_eviction.to_string()),
            ("enable_compression", self.enable_compression.to_string()),
            ("enable_emergency_eviction", self.enable_emergency_eviction.to_string()),
            (
                "enable_system_memory_monitoring",
                self.enable_system_memory_monitoring.to_string(),
            ),
        ]
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

const KEYS: [&str; 24] = [
    "max_total_memory_mb",
    "search_result_cache_mb",
    "page_text_cache_mb",
    "search_highlight_cache_mb",
    "pdf_render_cache_mb",
    "thumbnail_cache_mb",
    "max_total_memory_bytes",
    "search_result_cache_bytes",
    "page_text_cache_bytes",
    "search_highlight_cache_bytes",
    "pdf_render_cache_bytes",
    "thumbnail_cache_bytes",
    "cleanup_interval_ms",
    "system_memory_check_interval_ms",
    "warning_threshold",
    "critical_threshold",
    "system_memory_threshold",
    "enable_lru_eviction",
    "enable_memory_pressure_eviction",
    "enable_adaptive_management",
    "enable_predictive_eviction",
    "enable_compression",
    "enable_emergency_eviction",
    "enable_system_memory_monitoring",
];

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::invalid(key, value))
}

fn parse_mb(key: &str, value: &str) -> Result<i64, ConfigError> {
    let mb: i64 = parse(key, value)?;
    if mb < 0 {
        return Err(ConfigError::invalid(key, value));
    }
    Ok(mb * MB)
}

fn parse_bytes(key: &str, value: &str) -> Result<i64, ConfigError> {
    let bytes: i64 = parse(key, value)?;
    if bytes < 0 {
        return Err(ConfigError::invalid(key, value));
    }
    Ok(bytes)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = GlobalConfig::default();
        assert_eq!(config.max_total_memory, 512 * MB);
        assert_eq!(config.limit_for(CacheKind::SearchResult), 100 * MB);
        assert_eq!(config.limit_for(CacheKind::PageText), 50 * MB);
        assert_eq!(config.limit_for(CacheKind::SearchHighlight), 25 * MB);
        assert_eq!(config.limit_for(CacheKind::PdfRender), 256 * MB);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(30));
        assert_eq!(config.system_memory_check_interval(), Duration::from_secs(10));
        assert!(!config.enable_compression);
        assert!(config.enable_emergency_eviction);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = GlobalConfig::default()
            .with_total_mb(1024)
            .with_limit_mb(CacheKind::Thumbnail, 16)
            .with_thresholds(0.6, 0.5);

        assert_eq!(config.max_total_memory, 1024 * MB);
        assert_eq!(config.thumbnail_cache_limit, 16 * MB);
        assert!(config.warning_threshold < config.critical_threshold);
    }

    #[test]
    fn test_validate_reports_inverted_thresholds() {
        let config = GlobalConfig {
            warning_threshold: 0.9,
            critical_threshold: 0.8,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidThreshold { .. })
        ));

        // The effective thresholds are still usable
        let thresholds = config.thresholds();
        assert!(thresholds.warning() < thresholds.critical());
    }

    #[test]
    fn test_from_key_values() {
        let config = GlobalConfig::from_key_values([
            ("max_total_memory_mb", "256"),
            ("page_text_cache_mb", "10"),
            ("enable_compression", "true"),
            ("cleanup_interval_ms", "5000"),
            ("unknown_key", "whatever"),
        ])
        .unwrap();

        assert_eq!(config.max_total_memory, 256 * MB);
        assert_eq!(config.page_text_cache_limit, 10 * MB);
        assert!(config.enable_compression);
        assert_eq!(config.cleanup_interval_ms, 5000);
    }

    #[test]
    fn test_from_key_values_invalid() {
        let err = GlobalConfig::from_key_values([("warning_threshold", "high")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "warning_threshold"));

        assert!(GlobalConfig::from_key_values([("thumbnail_cache_mb", "-4")]).is_err());
        assert!(GlobalConfig::from_key_values([("enable_compression", "maybe")]).is_err());
    }

    #[test]
    fn test_parse_skips_comments() {
        let text = r#"
            # Cache limits
            max_total_memory_mb = 128
            enable_lru_eviction = "off"
        "#;

        let config = GlobalConfig::parse(text).unwrap();
        assert_eq!(config.max_total_memory, 128 * MB);
        assert!(!config.enable_lru_eviction);
    }

    #[test]
    fn test_key_value_roundtrip() {
        let config = GlobalConfig::default()
            .with_total_mb(300)
            .with_limit_mb(CacheKind::PdfRender, 120)
            .with_thresholds(0.7, 0.95);
        let parsed = GlobalConfig::parse(&config.to_key_value_text()).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.conf");

        let config = GlobalConfig::default().with_total_mb(64);
        config.save_to_file(&path).unwrap();

        let loaded = GlobalConfig::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_file_keeps_unaligned_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.conf");

        let mut config = GlobalConfig::default();
        config.max_total_memory = 3 * MB + 17;
        config.set_limit_for(CacheKind::PageText, 1_500_000);
        config.set_limit_for(CacheKind::Thumbnail, 300_000);
        config.save_to_file(&path).unwrap();

        let loaded = GlobalConfig::from_file(&path).unwrap();
        assert_eq!(loaded.page_text_cache_limit, 1_500_000);
        assert_eq!(loaded.thumbnail_cache_limit, 300_000);
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_byte_keys_take_exact_values() {
        let config = GlobalConfig::from_key_values([
            ("search_highlight_cache_bytes", "4097"),
            ("max_total_memory_mb", "2"),
        ])
        .unwrap();
        assert_eq!(config.search_highlight_cache_limit, 4097);
        assert_eq!(config.max_total_memory, 2 * MB);
        assert!(GlobalConfig::from_key_values([("pdf_render_cache_bytes", "-1")]).is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = GlobalConfig::from_file(dir.path().join("absent.conf"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_json_partial_uses_defaults() {
        let config = GlobalConfig::from_json(r#"{ "thumbnail_cache_limit": 1024 }"#).unwrap();
        assert_eq!(config.thumbnail_cache_limit, 1024);
        assert_eq!(config.max_total_memory, 512 * MB);

        let json = config.to_json().unwrap();
        assert_eq!(GlobalConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&[
            "PDF_READER_CACHE_MAX_TOTAL_MEMORY_MB",
            "PDF_READER_CACHE_ENABLE_COMPRESSION",
            "PDF_READER_CACHE_WARNING_THRESHOLD",
        ]);

        env::set_var("PDF_READER_CACHE_MAX_TOTAL_MEMORY_MB", "2048");
        env::set_var("PDF_READER_CACHE_ENABLE_COMPRESSION", "yes");
        env::set_var("PDF_READER_CACHE_WARNING_THRESHOLD", "0.6");

        let config = GlobalConfig::from_env().unwrap();
        assert_eq!(config.max_total_memory, 2048 * MB);
        assert!(config.enable_compression);
        assert_eq!(config.warning_threshold, 0.6);
        assert_eq!(config.page_text_cache_limit, 50 * MB); // default
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&["PDF_READER_CACHE_CLEANUP_INTERVAL_MS"]);

        env::set_var("PDF_READER_CACHE_CLEANUP_INTERVAL_MS", "soon");
        let err = GlobalConfig::from_env().unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PDF_READER_CACHE_CLEANUP_INTERVAL_MS")
        );
    }

    // Helper to save and restore environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }
}
