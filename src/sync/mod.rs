//! Sync orchestration.
//!
//! [`SyncOrchestrator`] walks the `(site, date)` work list strictly in order,
//! one external request at a time. For each unit it waits for rate-limit
//! headroom, opens the day's stream, writes every chunk through the storage
//! engine, and advances the checkpoint once the whole day is stored. Transient
//! source failures are retried with a fixed delay; a unit that still fails is
//! recorded and the job moves on. Only storage or checkpoint failures abort.

mod error;
mod hourly;
mod options;
mod plan;
mod summary;

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tracing::{debug, error, info, warn};

pub use error::{Result, SyncError};
pub use options::SyncOptions;
pub use plan::{date_range, resume_index, work_items};
pub use summary::SyncSummary;

use crate::models::{InsertMode, InsertStats, PerformanceRecord, Site};
use crate::rate_limit::RateLimiter;
use crate::repository::StorageEngine;
use crate::shutdown::SharedShutdown;
use crate::source::{DimensionChunk, ExternalDataSource, SourceError};
use crate::state::{FailedUnit, StateManager, SyncCheckpoint};

/// How one attempt at a unit ended, short of success.
#[derive(Debug)]
enum AttemptError {
    Source(SourceError),
    Storage(crate::repository::RepositoryError),
    Cancelled,
}

impl From<crate::repository::RepositoryError> for AttemptError {
    fn from(e: crate::repository::RepositoryError) -> Self {
        Self::Storage(e)
    }
}

/// How a unit ended after all attempts.
enum UnitOutcome<T> {
    Done(T),
    Failed { attempts: u32, error: SourceError },
    Cancelled,
}

/// Drives sync jobs against one external source.
pub struct SyncOrchestrator {
    storage: Arc<StorageEngine>,
    source: Arc<dyn ExternalDataSource>,
    limiter: RateLimiter,
    state: StateManager,
    shutdown: SharedShutdown,
    options: SyncOptions,
    requests: u64,
}

fn bind_chunk(site_id: i64, date: NaiveDate, chunk: DimensionChunk) -> Vec<PerformanceRecord> {
    let DimensionChunk {
        device,
        search_type,
        rows,
    } = chunk;
    rows.into_iter()
        .map(|row| PerformanceRecord {
            site_id,
            date,
            page: row.page,
            query: row.query,
            device: device.clone(),
            search_type: search_type.clone(),
            clicks: row.clicks,
            impressions: row.impressions,
            ctr: row.ctr,
            position: row.position,
        })
        .collect()
}

impl SyncOrchestrator {
    pub fn new(
        storage: Arc<StorageEngine>,
        source: Arc<dyn ExternalDataSource>,
        limiter: RateLimiter,
        state: StateManager,
        shutdown: SharedShutdown,
        options: SyncOptions,
    ) -> Self {
        Self {
            storage,
            source,
            limiter,
            state,
            shutdown,
            options,
            requests: 0,
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    /// Resolve `domains` to sites, creating unseen ones. An empty list means
    /// every registered site (active ones only if so configured).
    fn resolve_sites(&self, domains: &[String]) -> Result<Vec<Site>> {
        if domains.is_empty() {
            return Ok(self.storage.list_sites(self.options.only_active)?);
        }
        let mut sites: Vec<Site> = Vec::with_capacity(domains.len());
        for domain in domains {
            let site = self.storage.ensure_site(domain)?;
            if !sites.iter().any(|s| s.id == site.id) {
                sites.push(site);
            }
        }
        Ok(sites)
    }

    /// Wait for rate-limit headroom. Returns false if shutdown won the race.
    async fn throttle(&mut self) -> bool {
        let limiter = &mut self.limiter;
        let shutdown = &self.shutdown;
        tokio::select! {
            _ = limiter.check_and_wait() => true,
            _ = shutdown.wait_for_shutdown() => false,
        }
    }

    async fn record_request(&mut self) {
        self.limiter.record_request().await;
        self.requests += 1;
    }

    /// Sleep before a retry. Returns false if shutdown was requested.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.wait_for_shutdown() => false,
        }
    }

    fn retry_delay(&self, error: &SourceError) -> Duration {
        match error {
            SourceError::RateLimited {
                retry_after: Some(after),
            } => (*after).max(self.options.retry_delay),
            _ => self.options.retry_delay,
        }
    }

    /// Decide what to do after attempt `attempt` failed with `error`.
    /// Returns `Some(outcome)` when the unit is finished.
    async fn after_failure<T>(
        &self,
        label: &str,
        attempt: u32,
        error: SourceError,
    ) -> Option<UnitOutcome<T>> {
        if !error.is_transient() || attempt > self.options.max_retries {
            error!(unit = label, attempts = attempt, error = %error, "Giving up on unit");
            return Some(UnitOutcome::Failed {
                attempts: attempt,
                error,
            });
        }
        let delay = self.retry_delay(&error);
        warn!(
            unit = label,
            attempt,
            max_retries = self.options.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient source error, retrying"
        );
        if !self.pause(delay).await {
            return Some(UnitOutcome::Cancelled);
        }
        None
    }

    /// One attempt at a day: open the stream, pull every chunk, write.
    ///
    /// SKIP writes each chunk as it arrives and adds its counts to
    /// `day_stats` right away, so rows committed by an attempt that later
    /// fails are still accounted for. OVERWRITE collects the day and replaces
    /// it in one transaction, so an interrupted attempt leaves the previous
    /// data intact and counts nothing.
    async fn attempt_day(
        &mut self,
        site: &Site,
        date: NaiveDate,
        day_stats: &mut InsertStats,
    ) -> std::result::Result<(), AttemptError> {
        if !self.throttle().await {
            return Err(AttemptError::Cancelled);
        }
        let opened = self.source.stream_daily(&site.domain, date).await;
        self.record_request().await;
        let mut stream = opened.map_err(AttemptError::Source)?;

        let mut pending: Vec<Vec<PerformanceRecord>> = Vec::new();

        loop {
            if !self.throttle().await {
                return Err(AttemptError::Cancelled);
            }
            let next = stream.next_chunk().await;
            self.record_request().await;
            let Some(chunk) = next.map_err(AttemptError::Source)? else {
                break;
            };

            let device = chunk.device.clone();
            let search_type = chunk.search_type.clone();
            let records = bind_chunk(site.id, date, chunk);
            match self.options.mode {
                InsertMode::Skip => {
                    let stats = self
                        .storage
                        .run_blocking(move |storage| {
                            storage.insert_batch(&records, InsertMode::Skip)
                        })
                        .await?;
                    debug!(site_id = site.id, %date, %device, %search_type, %stats, "Chunk stored");
                    *day_stats += stats;
                }
                InsertMode::Overwrite => {
                    debug!(site_id = site.id, %date, %device, %search_type, rows = records.len(), "Chunk buffered");
                    pending.push(records);
                }
            }
        }

        if self.options.mode == InsertMode::Overwrite {
            let site_id = site.id;
            let replaced = self
                .storage
                .run_blocking(move |storage| storage.replace_day(site_id, date, &pending))
                .await?;
            for stats in replaced {
                *day_stats += stats;
            }
        }

        Ok(())
    }

    /// Sync one day with retries. Counts from every attempt land in
    /// `day_stats`, whatever the outcome.
    async fn sync_day(
        &mut self,
        site: &Site,
        date: NaiveDate,
        day_stats: &mut InsertStats,
    ) -> Result<UnitOutcome<()>> {
        let label = format!("{}@{}", site.domain, date);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt_day(site, date, day_stats).await {
                Ok(()) => return Ok(UnitOutcome::Done(())),
                Err(AttemptError::Cancelled) => return Ok(UnitOutcome::Cancelled),
                Err(AttemptError::Storage(e)) => return Err(e.into()),
                Err(AttemptError::Source(e)) => {
                    if let Some(outcome) = self.after_failure(&label, attempt, e).await {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Sync daily data for `domains` over `[start, end]`.
    ///
    /// Resumes from the stored checkpoint when it was written for the same
    /// site set and date range; otherwise starts from the first unit.
    pub async fn run(
        &mut self,
        domains: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SyncSummary> {
        if start > end {
            return Err(SyncError::InvalidRange { start, end });
        }
        let sites = self.resolve_sites(domains)?;
        if sites.is_empty() {
            return Err(SyncError::NoSites);
        }
        let site_ids: Vec<i64> = sites.iter().map(|s| s.id).collect();

        let decision = self
            .state
            .resume_point(self.options.mode, &site_ids, start, end)?;
        let resumed = decision.is_resume();
        let mut checkpoint = decision.into_checkpoint();
        self.state.save(&checkpoint)?;

        let items = work_items(&sites, start, end);
        let mut first = resume_index(&items, checkpoint.last_completed);
        if resumed && first == 0 && checkpoint.last_completed.is_some() {
            warn!("Checkpoint position not found in work list, starting from the beginning");
        }
        if first >= items.len() {
            // Stopped after its last unit without being marked complete
            info!(job_id = %checkpoint.job_id, "Checkpoint covers every unit, starting a new job");
            checkpoint = SyncCheckpoint::new(self.options.mode, start, end, site_ids.clone());
            self.state.save(&checkpoint)?;
            first = 0;
        }

        let mut summary = SyncSummary::new(checkpoint.job_id, self.options.mode);
        summary.days_resumed_past = first as u64;
        let requests_before = self.requests;

        info!(
            job_id = %checkpoint.job_id,
            mode = %self.options.mode,
            sites = sites.len(),
            %start,
            %end,
            units = items.len(),
            skipping = first,
            "Starting sync"
        );

        let storage = Arc::clone(&self.storage);
        let guard = if self.options.bulk_load {
            Some(storage.bulk_load()?)
        } else {
            None
        };

        for unit in &items[first..] {
            if self.shutdown.is_shutdown_requested() {
                summary.cancelled = true;
                break;
            }
            let Some(site) = sites.iter().find(|s| s.id == unit.site_id) else {
                continue;
            };

            let mut day_stats = InsertStats::default();
            let outcome = self.sync_day(site, unit.date, &mut day_stats).await?;
            summary.stats += day_stats;

            match outcome {
                UnitOutcome::Done(()) => {
                    info!(site_id = site.id, date = %unit.date, stats = %day_stats, "Day synced");
                    summary.days_completed += 1;
                    checkpoint.advance(*unit, day_stats);
                    self.state.save(&checkpoint)?;
                }
                UnitOutcome::Failed { attempts, error } => {
                    let failure = FailedUnit {
                        site_id: site.id,
                        domain: site.domain.clone(),
                        date: unit.date,
                        attempts,
                        error: error.to_string(),
                    };
                    summary.failed_units.push(failure.clone());
                    checkpoint.stats += day_stats;
                    checkpoint.record_failure(failure);
                    self.state.save(&checkpoint)?;
                }
                UnitOutcome::Cancelled => {
                    summary.cancelled = true;
                    if day_stats.total() > 0 {
                        checkpoint.stats += day_stats;
                        self.state.save(&checkpoint)?;
                    }
                    break;
                }
            }
        }

        if !summary.cancelled {
            checkpoint.mark_completed();
            self.state.save(&checkpoint)?;
        }

        if let Some(guard) = guard {
            guard.finish()?;
        }

        summary.api_requests = self.requests - requests_before;
        summary.finished_at = Utc::now();
        if summary.cancelled {
            warn!(job_id = %summary.job_id, last_completed = ?checkpoint.last_completed, "Sync cancelled");
        }
        info!(job_id = %summary.job_id, %summary, "Sync finished");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitConfig;
    use crate::shutdown::ShutdownCoordinator;
    use crate::source::{DailyRow, InMemorySource, ScriptedFailure};
    use tempfile::tempdir;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn chunk(device: &str, queries: std::ops::Range<usize>) -> DimensionChunk {
        DimensionChunk {
            device: device.to_string(),
            search_type: "web".to_string(),
            rows: queries
                .map(|i| DailyRow {
                    page: "/".to_string(),
                    query: format!("q{i}"),
                    clicks: 1,
                    impressions: 2,
                    ctr: 0.5,
                    position: 1.0,
                })
                .collect(),
        }
    }

    fn orchestrator(
        dir: &tempfile::TempDir,
        source: Arc<InMemorySource>,
        options: SyncOptions,
    ) -> SyncOrchestrator {
        let storage = Arc::new(StorageEngine::open(&dir.path().join("t.db")).unwrap());
        SyncOrchestrator::new(
            storage,
            source,
            RateLimiter::new(RateLimitConfig::default()),
            StateManager::new(dir.path().join("checkpoint.json")),
            ShutdownCoordinator::shared(),
            options,
        )
    }

    #[test]
    fn test_bind_chunk_carries_dimensions() {
        let records = bind_chunk(4, d(1), chunk("TABLET", 0..2));
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.device == "TABLET" && r.site_id == 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_retried_then_succeeds() {
        let dir = tempdir().unwrap();
        let source = Arc::new(
            InMemorySource::new()
                .with_day("example.com", d(1), vec![chunk("DESKTOP", 0..3)])
                .with_failure(
                    "example.com",
                    d(1),
                    ScriptedFailure {
                        after_chunks: 0,
                        error: SourceError::Transient("reset".into()),
                    },
                ),
        );
        let mut sync = orchestrator(&dir, Arc::clone(&source), SyncOptions::default());

        let summary = sync
            .run(&["example.com".to_string()], d(1), d(1))
            .await
            .unwrap();
        assert!(summary.is_complete());
        assert_eq!(summary.stats.inserted, 3);
        assert_eq!(source.opened().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_fails_unit_without_retry() {
        let dir = tempdir().unwrap();
        let source = Arc::new(
            InMemorySource::new()
                .with_day("example.com", d(2), vec![chunk("DESKTOP", 0..1)])
                .with_failure(
                    "example.com",
                    d(1),
                    ScriptedFailure {
                        after_chunks: 0,
                        error: SourceError::Permanent("forbidden".into()),
                    },
                ),
        );
        let mut sync = orchestrator(&dir, Arc::clone(&source), SyncOptions::default());

        let summary = sync
            .run(&["example.com".to_string()], d(1), d(2))
            .await
            .unwrap();
        assert_eq!(summary.failed_units.len(), 1);
        assert_eq!(summary.failed_units[0].date, d(1));
        assert_eq!(summary.failed_units[0].attempts, 1);
        assert_eq!(summary.days_completed, 1);
        assert_eq!(source.opened().await.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_range_and_no_sites() {
        let dir = tempdir().unwrap();
        let mut sync = orchestrator(&dir, Arc::new(InMemorySource::new()), SyncOptions::default());
        assert!(matches!(
            sync.run(&["example.com".to_string()], d(2), d(1)).await,
            Err(SyncError::InvalidRange { .. })
        ));
        assert!(matches!(
            sync.run(&[], d(1), d(1)).await,
            Err(SyncError::NoSites)
        ));
    }
}
