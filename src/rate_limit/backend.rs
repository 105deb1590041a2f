//! Pluggable persistence for the daily request counter.

use async_trait::async_trait;
use chrono::NaiveDate;

/// Result type for usage store operations.
pub type RateLimitResult<T> = Result<T, RateLimitError>;

/// Errors from usage store operations.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for RateLimitError {
    fn from(e: rusqlite::Error) -> Self {
        RateLimitError::Database(e.to_string())
    }
}

/// Storage for per-day request counts, keyed by UTC date.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Requests recorded for `date` (0 if none).
    async fn load(&self, date: NaiveDate) -> RateLimitResult<u64>;

    /// Record one request on `date` and return the new count.
    async fn increment(&self, date: NaiveDate) -> RateLimitResult<u64>;
}
