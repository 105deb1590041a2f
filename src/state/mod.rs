//! Checkpoint persistence for resumable sync jobs.
//!
//! The checkpoint is a pretty-printed JSON file so operators can inspect it.
//! Writes go to a temp file in the same directory which is then renamed over
//! the target, so a crash leaves either the old or the new checkpoint.

mod checkpoint;

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{debug, info, warn};

pub use checkpoint::{
    site_set_hash, CheckpointMismatch, FailedUnit, SyncCheckpoint, WorkUnit, CHECKPOINT_VERSION,
};

use crate::models::InsertMode;

/// Errors from checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("I/O error on checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Checkpoint {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Where a job should start.
#[derive(Debug, Clone)]
pub enum ResumeDecision {
    /// No usable checkpoint; start from the first unit with this new one.
    Fresh(SyncCheckpoint),
    /// Continue after `checkpoint.last_completed`.
    Resume(SyncCheckpoint),
}

impl ResumeDecision {
    pub fn checkpoint(&self) -> &SyncCheckpoint {
        match self {
            Self::Fresh(cp) | Self::Resume(cp) => cp,
        }
    }

    pub fn into_checkpoint(self) -> SyncCheckpoint {
        match self {
            Self::Fresh(cp) | Self::Resume(cp) => cp,
        }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, Self::Resume(_))
    }
}

/// Loads and saves the checkpoint file.
#[derive(Debug, Clone)]
pub struct StateManager {
    path: PathBuf,
}

impl StateManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Load the stored checkpoint, or `None` if there is none.
    pub fn load(&self) -> Result<Option<SyncCheckpoint>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        let checkpoint = serde_json::from_str(&data).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "Loaded checkpoint");
        Ok(Some(checkpoint))
    }

    /// Persist `checkpoint`, replacing the previous one atomically.
    pub fn save(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        let json = serde_json::to_string_pretty(checkpoint)?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| self.io_err(e))?;
        temp.write_all(json.as_bytes()).map_err(|e| self.io_err(e))?;
        temp.flush().map_err(|e| self.io_err(e))?;
        temp.as_file().sync_all().map_err(|e| self.io_err(e))?;
        temp.persist(&self.path).map_err(|e| self.io_err(e.error))?;

        debug!(
            path = %self.path.display(),
            last_completed = ?checkpoint.last_completed,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Decide whether a job over `site_ids` and `[start, end]` resumes.
    ///
    /// A checkpoint for a different site set or date range, one that no
    /// longer parses, or one whose job already completed starts a new job
    /// with a log line rather than an error.
    pub fn resume_point(
        &self,
        mode: InsertMode,
        site_ids: &[i64],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ResumeDecision> {
        let fresh = || SyncCheckpoint::new(mode, start, end, site_ids.to_vec());

        let stored = match self.load() {
            Ok(Some(cp)) => cp,
            Ok(None) => return Ok(ResumeDecision::Fresh(fresh())),
            Err(StateError::Corrupt { source, .. }) => {
                warn!(path = %self.path.display(), error = %source, "Discarding unreadable checkpoint");
                return Ok(ResumeDecision::Fresh(fresh()));
            }
            Err(e) => return Err(e),
        };

        if let Err(mismatch) = stored.check_compatible(site_ids, start, end) {
            warn!(
                job_id = %stored.job_id,
                reason = %mismatch,
                "Discarding checkpoint, starting from the beginning"
            );
            return Ok(ResumeDecision::Fresh(fresh()));
        }

        if stored.is_completed() {
            info!(
                job_id = %stored.job_id,
                days_completed = stored.days_completed,
                failed_units = stored.failed_units.len(),
                "Previous job completed, starting a new one"
            );
            return Ok(ResumeDecision::Fresh(fresh()));
        }

        if stored.mode != mode {
            info!(stored = %stored.mode, requested = %mode, "Resuming with a different insert mode");
        }

        let mut checkpoint = stored;
        checkpoint.mode = mode;
        info!(
            job_id = %checkpoint.job_id,
            last_completed = ?checkpoint.last_completed,
            days_completed = checkpoint.days_completed,
            "Resuming from checkpoint"
        );
        Ok(ResumeDecision::Resume(checkpoint))
    }
}
