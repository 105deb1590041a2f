//! Configuration management for sitestats.
//!
//! [`Config`] is the on-disk TOML file shape; every field is optional.
//! [`Settings`] holds the resolved values the library runs with.
//! [`load_settings`] merges defaults, the config file, and environment.

mod loader;
mod settings;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use loader::{load_settings, LoadOptions};
pub use settings::Settings;

/// Default database filename.
pub const DEFAULT_DATABASE_FILENAME: &str = "sitestats.db";

/// Default config filename looked up next to the data directory.
pub const CONFIG_FILENAME: &str = "sitestats.toml";

/// Default checkpoint filename inside the data directory.
pub const CHECKPOINT_FILENAME: &str = "sync_checkpoint.json";

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Rate limit section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_day: Option<u64>,
}

/// Sync section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Fixed delay between retry attempts, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<u64>,
    /// `"skip"` or `"overwrite"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_window_days: Option<u32>,
}

/// Buffered writer section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<usize>,
}

/// Analytics section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSection {
    /// Use DuckDB when compiled in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duckdb: Option<bool>,
    /// DuckDB memory limit, e.g. `"2GB"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Data directory path. Relative paths resolve against the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Database filename, joined with the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub writer: WriterSection,
    #[serde(default)]
    pub analytics: AnalyticsSection,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load and parse a TOML config file.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Directory of the file this config came from.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_full_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(
            &path,
            r#"
data_dir = "data"
database = "stats.db"

[rate_limit]
requests_per_minute = 600

[sync]
mode = "overwrite"
retry_delay_secs = 2

[analytics]
duckdb = false
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.data_dir.as_deref(), Some("data"));
        assert_eq!(config.rate_limit.requests_per_minute, Some(600));
        assert_eq!(config.rate_limit.requests_per_day, None);
        assert_eq!(config.sync.mode.as_deref(), Some("overwrite"));
        assert_eq!(config.analytics.duckdb, Some(false));
        assert_eq!(config.base_dir().as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "rate_limit = 5").unwrap();
        let err = Config::load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(CONFIG_FILENAME));
    }
}
