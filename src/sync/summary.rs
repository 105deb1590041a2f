//! Job summary reported after every run, including partial failures.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{InsertMode, InsertStats};
use crate::state::FailedUnit;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSummary {
    pub job_id: Uuid,
    pub mode: InsertMode,
    /// Counters for units processed by this run.
    pub stats: InsertStats,
    pub days_completed: u64,
    /// Units skipped because a checkpoint showed them done.
    pub days_resumed_past: u64,
    pub failed_units: Vec<FailedUnit>,
    pub cancelled: bool,
    /// External requests issued by this run.
    pub api_requests: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncSummary {
    pub(crate) fn new(job_id: Uuid, mode: InsertMode) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            mode,
            stats: InsertStats::default(),
            days_completed: 0,
            days_resumed_past: 0,
            failed_units: Vec::new(),
            cancelled: false,
            api_requests: 0,
            started_at: now,
            finished_at: now,
        }
    }

    /// No failures and not cancelled.
    pub fn is_complete(&self) -> bool {
        self.failed_units.is_empty() && !self.cancelled
    }
}

impl std::fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} days, {}, {} failed units, {} requests{}",
            self.days_completed,
            self.stats,
            self.failed_units.len(),
            self.api_requests,
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}
