//! SpillGraph configuration.
//!
//! [`SpillConfig`] covers the record store location, overflow (eviction)
//! tuning, registry compaction, observability toggles and logging. It is
//! assembled from layered sources by [`ConfigLoader`]:
//! - Global config: `~/.spillgraph/config.toml`
//! - Local config: `.spillgraph/config.toml` (next to the graph data)
//! - CLI overrides via [`ConfigOverrides`]
//!
//! Later layers win key by key.

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration for SpillGraph.
///
/// Represents the fully merged configuration from all sources.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SpillConfig {
    /// Storage configuration
    pub storage: StorageConfig,

    /// Overflow (eviction) configuration
    pub overflow: OverflowConfig,

    /// Node registry configuration
    pub registry: RegistryConfig,

    /// Observability toggles
    pub stats: StatsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Storage configuration for the node record store.
///
/// # Example TOML
///
/// ```toml
/// [storage]
/// location = "/var/lib/spillgraph/graph.db"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Backing file for the store. `None` means an ephemeral store that is
    /// deleted when the graph is closed.
    pub location: Option<PathBuf>,
}

impl StorageConfig {
    /// Whether the store is ephemeral (no explicit location).
    pub fn is_ephemeral(&self) -> bool {
        self.location.is_none()
    }
}

/// Overflow configuration.
///
/// Controls when resident node bodies are serialized to the store and
/// detached from their handles.
///
/// # Example TOML
///
/// ```toml
/// [overflow]
/// enabled = true
/// heap_threshold_percent = 80
/// memory_pool_mb = 1024
/// eviction_batch_size = 5000
/// policy = "lru"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OverflowConfig {
    /// Arm the eviction controller
    pub enabled: bool,

    /// Memory pressure threshold in percent of the tracked pool (0-100)
    pub heap_threshold_percent: u8,

    /// Size of the tracked memory pool in MB
    pub memory_pool_mb: u64,

    /// Maximum number of bodies detached per eviction round
    pub eviction_batch_size: usize,

    /// Candidate selection policy
    pub policy: EvictionPolicyKind,

    /// Sampling interval of the memory monitor in milliseconds
    pub monitor_interval_ms: u64,
}

impl Default for OverflowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heap_threshold_percent: 80,
            memory_pool_mb: 512,
            eviction_batch_size: 10_000,
            policy: EvictionPolicyKind::default(),
            monitor_interval_ms: 250,
        }
    }
}

impl OverflowConfig {
    /// Memory pool size in bytes.
    pub fn memory_pool_bytes(&self) -> usize {
        (self.memory_pool_mb as usize).saturating_mul(1024 * 1024)
    }

    /// Threshold as a ratio (0.0 - 1.0).
    pub fn threshold_ratio(&self) -> f64 {
        f64::from(self.heap_threshold_percent) / 100.0
    }

    /// Validate ranges of the overflow settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_threshold_percent > 100 {
            return Err(ConfigError::invalid_value(
                "overflow.heap_threshold_percent",
                format!("{} is not a percentage (0-100)", self.heap_threshold_percent),
            ));
        }
        if self.enabled && self.eviction_batch_size == 0 {
            return Err(ConfigError::invalid_value(
                "overflow.eviction_batch_size",
                "must be greater than zero when overflow is enabled",
            ));
        }
        if self.enabled && self.memory_pool_mb == 0 {
            return Err(ConfigError::invalid_value(
                "overflow.memory_pool_mb",
                "must be greater than zero when overflow is enabled",
            ));
        }
        if self.monitor_interval_ms == 0 {
            return Err(ConfigError::invalid_value(
                "overflow.monitor_interval_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Eviction candidate selection policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicyKind {
    /// Evict in the order bodies became resident (default)
    #[default]
    Fifo,
    /// Evict the least recently accessed body first
    Lru,
}

impl std::fmt::Display for EvictionPolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fifo => write!(f, "fifo"),
            Self::Lru => write!(f, "lru"),
        }
    }
}

impl std::str::FromStr for EvictionPolicyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fifo" | "queue" => Ok(Self::Fifo),
            "lru" => Ok(Self::Lru),
            _ => Err(ConfigError::invalid_value(
                "overflow.policy",
                format!("unknown policy '{}' (expected fifo or lru)", s),
            )),
        }
    }
}

/// Node registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Fraction of empty slots (0.0 - 1.0] that triggers automatic compaction
    pub compaction_threshold: f64,

    /// Slot array size below which automatic compaction never runs
    pub min_compaction_slots: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 0.5,
            min_compaction_slots: 1024,
        }
    }
}

impl RegistryConfig {
    /// Validate the compaction threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.compaction_threshold > 0.0 && self.compaction_threshold <= 1.0) {
            return Err(ConfigError::invalid_value(
                "registry.compaction_threshold",
                format!("{} is outside (0.0, 1.0]", self.compaction_threshold),
            ));
        }
        Ok(())
    }
}

/// Observability toggles.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct StatsConfig {
    /// Count serialization (persist) calls
    pub serialization_stats: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// JSON structured logging
    Json,
}

/// CLI overrides for configuration values.
///
/// Used to apply command-line arguments over file-based config.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override store location
    pub location: Option<PathBuf>,

    /// Override overflow flag
    pub overflow_enabled: Option<bool>,

    /// Override memory pressure threshold
    pub heap_threshold_percent: Option<u8>,

    /// Override eviction batch size
    pub eviction_batch_size: Option<usize>,

    /// Override eviction policy
    pub policy: Option<EvictionPolicyKind>,

    /// Override log level
    pub log_level: Option<String>,

    /// Override serialization stats toggle
    pub serialization_stats: Option<bool>,
}

impl SpillConfig {
    /// Configuration for an ephemeral graph with default settings.
    pub fn ephemeral() -> Self {
        Self::default()
    }

    /// Configuration for a durable graph stored at `location`.
    pub fn durable(location: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.location = Some(location.into());
        config
    }

    /// Apply CLI overrides to this configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref location) = overrides.location {
            self.storage.location = Some(location.clone());
        }

        if let Some(enabled) = overrides.overflow_enabled {
            self.overflow.enabled = enabled;
        }

        if let Some(threshold) = overrides.heap_threshold_percent {
            self.overflow.heap_threshold_percent = threshold;
        }

        if let Some(batch) = overrides.eviction_batch_size {
            self.overflow.eviction_batch_size = batch;
        }

        if let Some(policy) = overrides.policy {
            self.overflow.policy = policy;
        }

        if let Some(ref level) = overrides.log_level {
            self.logging.level = level.clone();
        }

        if let Some(stats) = overrides.serialization_stats {
            self.stats.serialization_stats = stats;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.overflow.validate()?;
        self.registry.validate()?;
        Ok(())
    }

    /// Resolve the store location against a base directory.
    ///
    /// Returns `None` for ephemeral stores.
    pub fn store_path(&self, base: &Path) -> Option<PathBuf> {
        self.storage.location.as_ref().map(|location| {
            if location.is_absolute() {
                location.clone()
            } else {
                base.join(location)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SpillConfig::default();
        assert!(config.storage.is_ephemeral());
        assert!(config.overflow.enabled);
        assert_eq!(config.overflow.heap_threshold_percent, 80);
        assert_eq!(config.overflow.policy, EvictionPolicyKind::Fifo);
        assert_eq!(config.registry.compaction_threshold, 0.5);
        assert!(!config.stats.serialization_stats);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = SpillConfig::default();
        let overrides = ConfigOverrides {
            location: Some(PathBuf::from("/data/graph.db")),
            heap_threshold_percent: Some(60),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        config.apply_overrides(&overrides);

        assert_eq!(
            config.storage.location,
            Some(PathBuf::from("/data/graph.db"))
        );
        assert_eq!(config.overflow.heap_threshold_percent, 60);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_store_path_resolution() {
        let config = SpillConfig::durable("graph.db");
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            config.store_path(&base),
            Some(PathBuf::from("/home/user/project/graph.db"))
        );
        assert_eq!(SpillConfig::ephemeral().store_path(&base), None);
    }

    #[test]
    fn test_store_path_absolute() {
        let config = SpillConfig::durable("/absolute/graph.db");
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            config.store_path(&base),
            Some(PathBuf::from("/absolute/graph.db"))
        );
    }

    #[test]
    fn test_threshold_out_of_range() {
        let mut config = SpillConfig::default();
        config.overflow.heap_threshold_percent = 120;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("heap_threshold_percent"));
    }

    #[test]
    fn test_zero_batch_only_rejected_when_enabled() {
        let mut config = SpillConfig::default();
        config.overflow.eviction_batch_size = 0;
        assert!(config.validate().is_err());

        config.overflow.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_compaction_threshold_range() {
        let mut config = SpillConfig::default();
        config.registry.compaction_threshold = 0.0;
        assert!(config.validate().is_err());

        config.registry.compaction_threshold = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "fifo".parse::<EvictionPolicyKind>().unwrap(),
            EvictionPolicyKind::Fifo
        );
        assert_eq!(
            "LRU".parse::<EvictionPolicyKind>().unwrap(),
            EvictionPolicyKind::Lru
        );
        assert!("clock".parse::<EvictionPolicyKind>().is_err());
        assert_eq!(EvictionPolicyKind::Lru.to_string(), "lru");
    }

    #[test]
    fn test_memory_pool_bytes() {
        let overflow = OverflowConfig {
            memory_pool_mb: 2,
            ..Default::default()
        };
        assert_eq!(overflow.memory_pool_bytes(), 2 * 1024 * 1024);
        assert!((overflow.threshold_ratio() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_overflow_toml_roundtrip() {
        let config = SpillConfig {
            overflow: OverflowConfig {
                enabled: false,
                heap_threshold_percent: 65,
                policy: EvictionPolicyKind::Lru,
                ..Default::default()
            },
            ..Default::default()
        };

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: SpillConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed, config);
    }
}
