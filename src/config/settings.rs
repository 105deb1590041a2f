//! Resolved runtime settings.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::InsertMode;
use crate::rate_limit::RateLimitConfig;
use crate::repository::{AnalyticsOptions, StorageOptions, WriterConfig};
use crate::sync::SyncOptions;

use super::{CHECKPOINT_FILENAME, DEFAULT_DATABASE_FILENAME};

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database filename.
    pub database_filename: String,
    /// Per-minute request ceiling for the external API.
    pub requests_per_minute: u32,
    /// Advisory daily request quota.
    pub requests_per_day: u64,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub default_mode: InsertMode,
    pub hourly_window_days: u32,
    pub writer_batch_size: usize,
    pub writer_flush_interval: Duration,
    pub writer_max_memory_bytes: usize,
    /// Use DuckDB for analytics when compiled in.
    pub analytics_duckdb: bool,
    pub analytics_memory_limit: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        // Local data dir, then home, then the working directory
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sitestats");

        let rate = RateLimitConfig::default();
        let sync = SyncOptions::default();
        let writer = WriterConfig::default();

        Self {
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            requests_per_minute: rate.requests_per_minute,
            requests_per_day: rate.requests_per_day,
            max_retries: sync.max_retries,
            retry_delay: sync.retry_delay,
            default_mode: sync.mode,
            hourly_window_days: sync.hourly_window_days,
            writer_batch_size: writer.batch_size,
            writer_flush_interval: writer.flush_interval,
            writer_max_memory_bytes: writer.max_memory_bytes,
            analytics_duckdb: true,
            analytics_memory_limit: None,
        }
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    /// Full path to the row-store database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    /// Full path to the sync checkpoint file.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(CHECKPOINT_FILENAME)
    }

    /// Ensure the data directory exists.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create data directory '{}': {}",
                    self.data_dir.display(),
                    e
                ),
            )
        })
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: self.requests_per_minute,
            requests_per_day: self.requests_per_day,
            ..Default::default()
        }
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_size: self.writer_batch_size,
            flush_interval: self.writer_flush_interval,
            max_memory_bytes: self.writer_max_memory_bytes,
            mode: InsertMode::Skip,
        }
    }

    /// Sync options seeded from settings; callers set `mode` and
    /// `bulk_load` per job.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            mode: self.default_mode,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            hourly_window_days: self.hourly_window_days,
            writer: self.writer_config(),
            ..Default::default()
        }
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            analytics: AnalyticsOptions {
                prefer_duckdb: self.analytics_duckdb,
                memory_limit: self.analytics_memory_limit.clone(),
            },
        }
    }
}
