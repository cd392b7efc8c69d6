//! Configuration loader with layered sources.
//!
//! Sources, lowest precedence first:
//! 1. Global config: `~/.spillgraph/config.toml`
//! 2. Local config: `.spillgraph/config.toml` next to the graph data
//! 3. CLI overrides
//!
//! File layers are merged as TOML tables before deserializing, so a key is
//! overridden only when a later file actually sets it. A local file that sets
//! `heap_threshold_percent = 80` overrides a global 70 even though 80 is the
//! built-in default.

use crate::error::ConfigError;
use crate::{ConfigOverrides, SpillConfig};
use std::path::{Path, PathBuf};
use toml::{Table, Value};
use tracing::{debug, trace};

/// Configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Directory holding the config file, under the home or data directory.
const CONFIG_DIR: &str = ".spillgraph";

/// Loads and merges configuration layers.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Global config directory (`~/.spillgraph`), if a home directory exists
    global_config_dir: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader using `~/.spillgraph` as the global directory.
    pub fn new() -> Self {
        Self {
            global_config_dir: dirs::home_dir().map(|h| h.join(CONFIG_DIR)),
        }
    }

    /// Loader with a custom global config directory.
    pub fn with_global_dir(global_dir: impl Into<PathBuf>) -> Self {
        Self {
            global_config_dir: Some(global_dir.into()),
        }
    }

    pub fn global_config_path(&self) -> Option<PathBuf> {
        self.global_config_dir
            .as_ref()
            .map(|d| d.join(CONFIG_FILE_NAME))
    }

    pub fn local_config_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(CONFIG_DIR).join(CONFIG_FILE_NAME)
    }

    /// Load configuration for a data directory with optional CLI overrides.
    ///
    /// A relative `storage.location` from either file is resolved against
    /// `base_dir`. Override locations are taken as given. The result is
    /// validated.
    pub fn load(
        &self,
        base_dir: &Path,
        overrides: Option<&ConfigOverrides>,
    ) -> Result<SpillConfig, ConfigError> {
        let mut merged = Table::new();
        for path in self.layer_paths(base_dir) {
            if !path.exists() {
                trace!("No config at {:?}", path);
                continue;
            }
            debug!("Loading config layer {:?}", path);
            merge_tables(&mut merged, read_table(&path)?);
        }

        let mut config: SpillConfig = Value::Table(merged)
            .try_into()
            .map_err(ConfigError::Merge)?;
        config.storage.location = config.store_path(base_dir);

        if let Some(overrides) = overrides {
            config.apply_overrides(overrides);
        }
        config.validate()?;
        Ok(config)
    }

    /// Load a single explicit configuration file, without layering.
    pub fn load_file(&self, path: &Path) -> Result<SpillConfig, ConfigError> {
        let table = read_table(path)?;
        let config: SpillConfig = Value::Table(table)
            .try_into()
            .map_err(|e| ConfigError::parse_toml(path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn layer_paths(&self, base_dir: &Path) -> Vec<PathBuf> {
        self.global_config_path()
            .into_iter()
            .chain(std::iter::once(self.local_config_path(base_dir)))
            .collect()
    }
}

/// Read one layer and check that it deserializes on its own
///
/// Checking each file separately keeps type errors attributed to the file
/// that caused them.
fn read_table(path: &Path) -> Result<Table, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
    let table: Table = content
        .parse()
        .map_err(|e| ConfigError::parse_toml(path, e))?;
    Value::Table(table.clone())
        .try_into::<SpillConfig>()
        .map_err(|e| ConfigError::parse_toml(path, e))?;
    Ok(table)
}

/// Merge `overlay` into `base`, recursing into sub-tables
fn merge_tables(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EvictionPolicyKind;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write_local(content: &str, dir: &Path) -> PathBuf {
        let config_dir = dir.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        let path = config_dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn write_global(content: &str, dir: &Path) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE_NAME), content).unwrap();
        dir.to_path_buf()
    }

    #[test]
    fn test_load_default_config() {
        let temp = TempDir::new().unwrap();
        let loader = ConfigLoader::with_global_dir(temp.path().join("global"));

        let config = loader.load(temp.path(), None).unwrap();

        assert_eq!(config, SpillConfig::default());
    }

    #[test]
    fn test_load_local_config() {
        let temp = TempDir::new().unwrap();
        let loader = ConfigLoader::with_global_dir(temp.path().join("global"));

        write_local(
            r#"
            [storage]
            location = "graph.db"

            [overflow]
            policy = "lru"
            eviction_batch_size = 64
            "#,
            temp.path(),
        );

        let config = loader.load(temp.path(), None).unwrap();

        assert_eq!(config.storage.location, Some(temp.path().join("graph.db")));
        assert_eq!(config.overflow.policy, EvictionPolicyKind::Lru);
        assert_eq!(config.overflow.eviction_batch_size, 64);
        assert_eq!(config.overflow.heap_threshold_percent, 80);
    }

    #[test]
    fn test_local_overrides_global_per_key() {
        let temp = TempDir::new().unwrap();
        let global_dir = write_global(
            r#"
            [logging]
            level = "debug"

            [overflow]
            heap_threshold_percent = 70
            memory_pool_mb = 64
            "#,
            &temp.path().join("global"),
        );

        // Explicitly setting the built-in default still wins over the global layer
        write_local(
            r#"
            [overflow]
            heap_threshold_percent = 80
            "#,
            temp.path(),
        );

        let config = ConfigLoader::with_global_dir(&global_dir)
            .load(temp.path(), None)
            .unwrap();

        assert_eq!(config.overflow.heap_threshold_percent, 80);
        assert_eq!(config.overflow.memory_pool_mb, 64);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_all() {
        let temp = TempDir::new().unwrap();
        write_local(
            r#"
            [storage]
            location = "local.db"

            [overflow]
            enabled = false
            "#,
            temp.path(),
        );

        let overrides = ConfigOverrides {
            location: Some(PathBuf::from("cli.db")),
            overflow_enabled: Some(true),
            log_level: Some("trace".to_string()),
            ..Default::default()
        };

        let config = ConfigLoader::with_global_dir(temp.path().join("global"))
            .load(temp.path(), Some(&overrides))
            .unwrap();

        assert!(config.overflow.enabled);
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.storage.location, Some(PathBuf::from("cli.db")));
    }

    #[test]
    fn test_invalid_local_config_rejected() {
        let temp = TempDir::new().unwrap();
        write_local(
            r#"
            [overflow]
            heap_threshold_percent = 95
            policy = "clock"
            "#,
            temp.path(),
        );

        let loader = ConfigLoader::with_global_dir(temp.path().join("global"));
        let err = loader.load(temp.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::ParseToml { .. }));

        write_local(
            r#"
            [overflow]
            heap_threshold_percent = 100
            eviction_batch_size = 0
            "#,
            temp.path(),
        );
        let err = loader.load(temp.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_parse_error_reports_path() {
        let temp = TempDir::new().unwrap();
        let path = write_local("[overflow\nenabled = ", temp.path());

        let loader = ConfigLoader::with_global_dir(temp.path().join("global"));
        let err = loader.load_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseToml { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_type_error_names_offending_layer() {
        let temp = TempDir::new().unwrap();
        let global_dir = write_global(
            r#"
            [overflow]
            memory_pool_mb = "lots"
            "#,
            &temp.path().join("global"),
        );

        let err = ConfigLoader::with_global_dir(&global_dir)
            .load(temp.path(), None)
            .unwrap_err();
        match err {
            ConfigError::ParseToml { path, .. } => assert!(path.starts_with(&global_dir)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_file_skips_layering() {
        let temp = TempDir::new().unwrap();
        let global_dir = write_global(
            r#"
            [logging]
            level = "debug"
            "#,
            &temp.path().join("global"),
        );
        let explicit = temp.path().join("explicit.toml");
        std::fs::write(&explicit, "[stats]\nserialization_stats = true\n").unwrap();

        let config = ConfigLoader::with_global_dir(&global_dir)
            .load_file(&explicit)
            .unwrap();
        assert!(config.stats.serialization_stats);
        assert_eq!(config.logging.level, "info");
    }
}
