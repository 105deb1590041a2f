//! Hourly sync over the source's short trailing window.
//!
//! Hourly data is not checkpointed: the window is a few days wide and
//! re-syncing it in SKIP mode is idempotent.

use chrono::{Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AttemptError, Result, SyncError, SyncOrchestrator, SyncSummary, UnitOutcome};
use crate::models::{HourlyRecord, InsertMode, InsertStats, Site};
use crate::repository::{BufferedWriter, WriterConfig};
use crate::source::HourlyRow;
use crate::state::FailedUnit;

/// Clamp `[start, end]` to the `window_days` ending at `today`.
///
/// Returns `None` when nothing of the request falls inside the window.
pub(crate) fn clamp_to_window(
    start: NaiveDate,
    end: NaiveDate,
    today: NaiveDate,
    window_days: u32,
) -> Option<(NaiveDate, NaiveDate)> {
    let window_start = today - Duration::days(i64::from(window_days.saturating_sub(1)));
    let start = start.max(window_start);
    let end = end.min(today);
    (start <= end).then_some((start, end))
}

fn bind_row(site_id: i64, row: HourlyRow) -> HourlyRecord {
    HourlyRecord {
        site_id,
        date: row.date,
        hour: row.hour,
        query: row.query,
        page: row.page,
        position: row.position,
        clicks: row.clicks,
        impressions: row.impressions,
        ctr: row.ctr,
    }
}

impl SyncOrchestrator {
    /// One attempt at a site's hourly range.
    async fn attempt_hourly(
        &mut self,
        site: &Site,
        start: NaiveDate,
        end: NaiveDate,
    ) -> std::result::Result<InsertStats, AttemptError> {
        if !self.throttle().await {
            return Err(AttemptError::Cancelled);
        }
        let opened = self.source.stream_hourly(&site.domain, start, end).await;
        self.record_request().await;
        let mut stream = opened.map_err(AttemptError::Source)?;

        let mut rejected = 0u64;
        let mut records: Vec<HourlyRecord> = Vec::new();
        loop {
            if !self.throttle().await {
                return Err(AttemptError::Cancelled);
            }
            let next = stream.next_batch().await;
            self.record_request().await;
            let Some(batch) = next.map_err(AttemptError::Source)? else {
                break;
            };
            for row in batch {
                let record = bind_row(site.id, row);
                if record.has_valid_hour() && record.date >= start && record.date <= end {
                    records.push(record);
                } else {
                    debug!(site_id = site.id, date = %record.date, hour = record.hour, "Dropping out-of-range hourly row");
                    rejected += 1;
                }
            }
        }

        let site_id = site.id;
        let mut stats = match self.options.mode {
            InsertMode::Skip => {
                let config = WriterConfig {
                    mode: InsertMode::Skip,
                    ..self.options.writer.clone()
                };
                self.storage
                    .run_blocking(move |storage| {
                        let mut writer = BufferedWriter::new(storage, config);
                        writer.add_batch(records)?;
                        writer.close()
                    })
                    .await?
            }
            InsertMode::Overwrite => {
                self.storage
                    .run_blocking(move |storage| {
                        storage.replace_hourly_range(site_id, start, end, &records)
                    })
                    .await?
            }
        };
        stats.failed += rejected;
        Ok(stats)
    }

    /// Sync hourly data for `domains`, clamped to the trailing hourly window.
    pub async fn sync_hourly(
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

        let mut summary = SyncSummary::new(Uuid::new_v4(), self.options.mode);
        let today = Utc::now().date_naive();
        let Some((start, end)) =
            clamp_to_window(start, end, today, self.options.hourly_window_days)
        else {
            warn!(%start, %end, window_days = self.options.hourly_window_days, "Requested range is outside the hourly window");
            summary.finished_at = Utc::now();
            return Ok(summary);
        };

        info!(sites = sites.len(), %start, %end, mode = %self.options.mode, "Starting hourly sync");
        let requests_before = self.requests;

        for site in &sites {
            if self.shutdown.is_shutdown_requested() {
                summary.cancelled = true;
                break;
            }

            let label = format!("{}@hourly", site.domain);
            let mut attempt = 0;
            let outcome = loop {
                attempt += 1;
                match self.attempt_hourly(site, start, end).await {
                    Ok(stats) => break UnitOutcome::Done(stats),
                    Err(AttemptError::Cancelled) => break UnitOutcome::Cancelled,
                    Err(AttemptError::Storage(e)) => return Err(e.into()),
                    Err(AttemptError::Source(e)) => {
                        if let Some(outcome) = self.after_failure(&label, attempt, e).await {
                            break outcome;
                        }
                    }
                }
            };

            match outcome {
                UnitOutcome::Done(stats) => {
                    info!(site_id = site.id, %stats, "Hourly data synced");
                    summary.stats += stats;
                    summary.days_completed += (end - start).num_days() as u64 + 1;
                }
                UnitOutcome::Failed { attempts, error } => {
                    summary.failed_units.push(FailedUnit {
                        site_id: site.id,
                        domain: site.domain.clone(),
                        date: start,
                        attempts,
                        error: error.to_string(),
                    });
                }
                UnitOutcome::Cancelled => {
                    summary.cancelled = true;
                    break;
                }
            }
        }

        summary.api_requests = self.requests - requests_before;
        summary.finished_at = Utc::now();
        info!(%summary, "Hourly sync finished");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn test_clamp_to_window() {
        // window of 10 days ending on the 20th starts on the 11th
        assert_eq!(clamp_to_window(d(1), d(31), d(20), 10), Some((d(11), d(20))));
        assert_eq!(clamp_to_window(d(15), d(16), d(20), 10), Some((d(15), d(16))));
        assert_eq!(clamp_to_window(d(1), d(5), d(20), 10), None);
    }
}
