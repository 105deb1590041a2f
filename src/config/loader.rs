//! Configuration loading and merging logic.
//!
//! Precedence, lowest first: built-in defaults, the config file, environment
//! variables, explicit [`LoadOptions`] values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::{Config, ConfigError, Settings, CONFIG_FILENAME};
use crate::models::InsertMode;

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
    /// Data directory or database file.
    /// Can be a directory containing sitestats.db or a .db file directly.
    pub data: Option<PathBuf>,
    /// Skip reading `.env`.
    pub skip_dotenv: bool,
}

/// Resolve a data path to `(directory, database filename)`.
fn resolve_data_path(path: &Path) -> (PathBuf, Option<String>) {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };

    if path
        .extension()
        .is_some_and(|ext| ext == "db" || ext == "sqlite" || ext == "sqlite3")
    {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned());
        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        (dir, filename)
    } else {
        (path, None)
    }
}

/// Look for a config file next to the data directory.
fn find_config_next_to_data(data_dir: &Path) -> Option<PathBuf> {
    let path = data_dir.join(CONFIG_FILENAME);
    path.exists().then_some(path)
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env_var(key) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}

/// Apply file values onto `settings`.
fn apply_config(settings: &mut Settings, config: &Config) -> Result<(), ConfigError> {
    if let Some(ref dir) = config.data_dir {
        let dir = PathBuf::from(dir);
        settings.data_dir = match config.base_dir() {
            Some(base) if dir.is_relative() => base.join(dir),
            _ => dir,
        };
    }
    if let Some(ref db) = config.database {
        settings.database_filename = db.clone();
    }

    if let Some(v) = config.rate_limit.requests_per_minute {
        settings.requests_per_minute = v;
    }
    if let Some(v) = config.rate_limit.requests_per_day {
        settings.requests_per_day = v;
    }

    if let Some(v) = config.sync.max_retries {
        settings.max_retries = v;
    }
    if let Some(v) = config.sync.retry_delay_secs {
        settings.retry_delay = Duration::from_secs(v);
    }
    if let Some(ref mode) = config.sync.mode {
        settings.default_mode =
            InsertMode::from_str(mode).ok_or_else(|| ConfigError::InvalidValue {
                key: "sync.mode".to_string(),
                value: mode.clone(),
            })?;
    }
    if let Some(v) = config.sync.hourly_window_days {
        settings.hourly_window_days = v;
    }

    if let Some(v) = config.writer.batch_size {
        settings.writer_batch_size = v.max(1);
    }
    if let Some(v) = config.writer.flush_interval_secs {
        settings.writer_flush_interval = Duration::from_secs(v);
    }
    if let Some(v) = config.writer.max_memory_mb {
        settings.writer_max_memory_bytes = v * 1024 * 1024;
    }

    if let Some(v) = config.analytics.duckdb {
        settings.analytics_duckdb = v;
    }
    if let Some(ref v) = config.analytics.memory_limit {
        settings.analytics_memory_limit = Some(v.clone());
    }
    Ok(())
}

/// Apply `SITESTATS_*` environment overrides.
fn apply_env(settings: &mut Settings) -> Result<(), ConfigError> {
    if let Some(dir) = env_var("SITESTATS_DATA_DIR") {
        settings.data_dir = PathBuf::from(dir);
    }
    if let Some(db) = env_var("SITESTATS_DATABASE") {
        settings.database_filename = db;
    }
    if let Some(v) = parse_env("SITESTATS_REQUESTS_PER_MINUTE")? {
        settings.requests_per_minute = v;
    }
    if let Some(v) = parse_env("SITESTATS_REQUESTS_PER_DAY")? {
        settings.requests_per_day = v;
    }
    Ok(())
}

/// Load settings with explicit options.
/// Returns the resolved settings and the file config they were built from.
pub fn load_settings(options: LoadOptions) -> Result<(Settings, Config), ConfigError> {
    if !options.skip_dotenv {
        // A missing .env is normal
        let _ = dotenvy::dotenv();
    }

    let data_override = options.data.as_deref().map(resolve_data_path);

    let config_path = options.config_path.clone().or_else(|| {
        let dir = data_override
            .as_ref()
            .map(|(dir, _)| dir.clone())
            .or_else(|| env_var("SITESTATS_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(|| Settings::default().data_dir);
        find_config_next_to_data(&dir)
    });

    let config = match config_path {
        Some(ref path) => {
            debug!(path = %path.display(), "Loading config file");
            Config::load_from_path(path)?
        }
        None => Config::default(),
    };

    let mut settings = Settings::default();
    apply_config(&mut settings, &config)?;
    apply_env(&mut settings)?;

    if let Some((dir, filename)) = data_override {
        settings.data_dir = dir;
        if let Some(filename) = filename {
            settings.database_filename = filename;
        }
    }

    debug!(
        data_dir = %settings.data_dir.display(),
        database = %settings.database_filename,
        "Settings resolved"
    );
    Ok((settings, config))
}
