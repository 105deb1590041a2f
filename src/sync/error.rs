//! Job-fatal sync errors.
//!
//! Failures local to one `(site, date)` unit never surface here; they are
//! reported in the summary's failed units.

use chrono::NaiveDate;

use crate::repository::RepositoryError;
use crate::state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Storage failure: {0}")]
    Storage(#[from] RepositoryError),
    #[error("Checkpoint failure: {0}")]
    State(#[from] StateError),
    #[error("Invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("No sites to sync")]
    NoSites,
}

pub type Result<T> = std::result::Result<T, SyncError>;
