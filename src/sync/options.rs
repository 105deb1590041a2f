//! Per-job sync options.

use std::time::Duration;

use crate::models::InsertMode;
use crate::repository::WriterConfig;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// SKIP keeps stored rows; OVERWRITE replaces each synced day.
    pub mode: InsertMode,
    /// Retries after the first attempt for transient source failures.
    pub max_retries: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Wrap the job in bulk-load mode.
    pub bulk_load: bool,
    /// With no explicit domains, sync only active sites.
    pub only_active: bool,
    /// Days of hourly data the source keeps, ending today.
    pub hourly_window_days: u32,
    /// Buffering for hourly SKIP writes.
    pub writer: WriterConfig,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: InsertMode::Skip,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            bulk_load: false,
            only_active: true,
            hourly_window_days: 10,
            writer: WriterConfig::default(),
        }
    }
}
