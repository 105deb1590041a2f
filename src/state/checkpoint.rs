//! Persisted sync progress.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{InsertMode, InsertStats};

/// Checkpoint file format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Identity hash of an ordered site set.
///
/// Order matters: the work list iterates sites in this order, so a reordered
/// set yields a different resume position.
pub fn site_set_hash(site_ids: &[i64]) -> String {
    let mut hasher = Sha256::new();
    for id in site_ids {
        hasher.update(id.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// A `(site, date)` unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkUnit {
    pub site_id: i64,
    pub date: NaiveDate,
}

/// A unit that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub site_id: i64,
    pub domain: String,
    pub date: NaiveDate,
    pub attempts: u32,
    pub error: String,
}

/// Why a stored checkpoint cannot be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointMismatch {
    SiteSet { stored: String, current: String },
    DateRange {
        stored: (NaiveDate, NaiveDate),
        current: (NaiveDate, NaiveDate),
    },
    Version(u32),
}

impl std::fmt::Display for CheckpointMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SiteSet { stored, current } => write!(
                f,
                "site set changed ({} -> {})",
                &stored[..stored.len().min(12)],
                &current[..current.len().min(12)]
            ),
            Self::DateRange { stored, current } => write!(
                f,
                "date range changed ({}..{} -> {}..{})",
                stored.0, stored.1, current.0, current.1
            ),
            Self::Version(v) => write!(f, "unsupported checkpoint version {}", v),
        }
    }
}

/// Progress marker for one sync job.
///
/// Created at job start, advanced after every completed date, never deleted
/// automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub version: u32,
    pub job_id: Uuid,
    pub mode: InsertMode,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Sites in work-list order.
    pub site_ids: Vec<i64>,
    pub site_set_hash: String,
    pub last_completed: Option<WorkUnit>,
    /// Cumulative counters across every run of this job.
    pub stats: InsertStats,
    pub days_completed: u64,
    pub failed_units: Vec<FailedUnit>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once a run walked the whole work list. A completed checkpoint
    /// is kept for inspection but never resumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncCheckpoint {
    pub fn new(mode: InsertMode, start: NaiveDate, end: NaiveDate, site_ids: Vec<i64>) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            job_id: Uuid::new_v4(),
            mode,
            start_date: start,
            end_date: end,
            site_set_hash: site_set_hash(&site_ids),
            site_ids,
            last_completed: None,
            stats: InsertStats::default(),
            days_completed: 0,
            failed_units: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Check whether this checkpoint belongs to a job over `site_ids` and
    /// `[start, end]`.
    pub fn check_compatible(
        &self,
        site_ids: &[i64],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<(), CheckpointMismatch> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointMismatch::Version(self.version));
        }
        let current = site_set_hash(site_ids);
        if current != self.site_set_hash {
            return Err(CheckpointMismatch::SiteSet {
                stored: self.site_set_hash.clone(),
                current,
            });
        }
        if (self.start_date, self.end_date) != (start, end) {
            return Err(CheckpointMismatch::DateRange {
                stored: (self.start_date, self.end_date),
                current: (start, end),
            });
        }
        Ok(())
    }

    /// Move the checkpoint past a completed unit.
    pub fn advance(&mut self, unit: WorkUnit, day_stats: InsertStats) {
        self.last_completed = Some(unit);
        self.stats += day_stats;
        self.days_completed += 1;
        self.updated_at = Utc::now();
    }

    /// Mark the job as having reached the end of its work list.
    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Record a failed unit without moving the resume position.
    pub fn record_failure(&mut self, failure: FailedUnit) {
        self.failed_units
            .retain(|f| !(f.site_id == failure.site_id && f.date == failure.date));
        self.failed_units.push(failure);
        self.updated_at = Utc::now();
    }
}
