//! External reporting API contract.
//!
//! The API is pull-based and strictly sequential: a daily stream yields one
//! chunk per dimension tuple (device × search type) and then signals the end.
//! Streams are not restartable; a retry opens a new stream from the start.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

pub use memory::{InMemorySource, ScriptedFailure};

/// Errors surfaced by an external data source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// Network or 5xx-class failure; worth retrying.
    #[error("Transient source error: {0}")]
    Transient(String),
    /// The source pushed back (HTTP 429); worth retrying.
    #[error("Rate limited by source")]
    RateLimited { retry_after: Option<Duration> },
    /// Bad request, missing permission, unknown site; retrying will not help.
    #[error("Source error: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Raw daily row as reported by the source, before it is bound to a site id.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyRow {
    pub page: String,
    pub query: String,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
    pub position: f64,
}

/// Raw hourly row as reported by the source.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyRow {
    pub date: NaiveDate,
    pub hour: u8,
    pub query: String,
    pub page: String,
    pub position: f64,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
}

/// Rows for one dimension tuple of one day.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionChunk {
    pub device: String,
    pub search_type: String,
    pub rows: Vec<DailyRow>,
}

/// Finite, non-restartable stream of daily chunks.
#[async_trait]
pub trait DailyStream: Send {
    /// Next chunk, or `None` at end of stream.
    async fn next_chunk(&mut self) -> SourceResult<Option<DimensionChunk>>;
}

/// Finite, non-restartable stream of hourly row batches.
#[async_trait]
pub trait HourlyStream: Send {
    /// Next batch, or `None` at end of stream.
    async fn next_batch(&mut self) -> SourceResult<Option<Vec<HourlyRow>>>;
}

/// The external reporting API.
///
/// Implementations must tolerate being called strictly one request at a time;
/// callers never issue concurrent requests.
#[async_trait]
pub trait ExternalDataSource: Send + Sync {
    /// Open the daily stream for `site_url` on `date`.
    async fn stream_daily(
        &self,
        site_url: &str,
        date: NaiveDate,
    ) -> SourceResult<Box<dyn DailyStream>>;

    /// Open the hourly stream for `site_url` over `[start, end]`.
    async fn stream_hourly(
        &self,
        site_url: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> SourceResult<Box<dyn HourlyStream>>;
}
