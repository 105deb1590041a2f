//! Scripted in-memory source for tests and offline runs.
//!
//! Serves fixed data per `(domain, date)`, can fail on a schedule, and keeps
//! counters that reveal whether a caller ever overlapped two requests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;

use super::{
    DailyStream, DimensionChunk, ExternalDataSource, HourlyRow, HourlyStream, SourceError,
    SourceResult,
};
use crate::models::normalize_domain;

/// One scripted failure, consumed by the next matching request.
#[derive(Debug, Clone)]
pub struct ScriptedFailure {
    /// Chunks delivered before the error; 0 fails at stream open.
    pub after_chunks: usize,
    pub error: SourceError,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: AtomicUsize,
}

impl Counters {
    fn enter(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory [`ExternalDataSource`].
#[derive(Default)]
pub struct InMemorySource {
    daily: HashMap<(String, NaiveDate), Vec<DimensionChunk>>,
    hourly: HashMap<String, Vec<HourlyRow>>,
    failures: Mutex<HashMap<(String, NaiveDate), VecDeque<ScriptedFailure>>>,
    opened: Mutex<Vec<(String, NaiveDate)>>,
    latency: Duration,
    counters: Arc<Counters>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `chunks` for `domain` on `date`.
    pub fn with_day(mut self, domain: &str, date: NaiveDate, chunks: Vec<DimensionChunk>) -> Self {
        self.daily.insert((normalize_domain(domain), date), chunks);
        self
    }

    /// Serve `rows` from the hourly endpoint for `domain`.
    pub fn with_hourly(mut self, domain: &str, rows: Vec<HourlyRow>) -> Self {
        self.hourly.insert(normalize_domain(domain), rows);
        self
    }

    /// Fail the next request for `(domain, date)` as scripted. Repeated calls
    /// queue further failures for later attempts.
    pub fn with_failure(mut self, domain: &str, date: NaiveDate, failure: ScriptedFailure) -> Self {
        self.failures
            .get_mut()
            .entry((normalize_domain(domain), date))
            .or_default()
            .push_back(failure);
        self
    }

    /// Simulated per-request latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Replace the data served for a day (e.g. to simulate upstream revisions).
    pub fn set_day(&mut self, domain: &str, date: NaiveDate, chunks: Vec<DimensionChunk>) {
        self.daily.insert((normalize_domain(domain), date), chunks);
    }

    /// Highest number of requests ever in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    /// Total requests served (stream opens plus chunk pulls).
    pub fn request_count(&self) -> usize {
        self.counters.requests.load(Ordering::SeqCst)
    }

    /// Every daily stream opened, in order.
    pub async fn opened(&self) -> Vec<(String, NaiveDate)> {
        self.opened.lock().await.clone()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

struct MemoryDailyStream {
    chunks: VecDeque<DimensionChunk>,
    delivered: usize,
    failure: Option<ScriptedFailure>,
    latency: Duration,
    counters: Arc<Counters>,
}

#[async_trait]
impl DailyStream for MemoryDailyStream {
    async fn next_chunk(&mut self) -> SourceResult<Option<DimensionChunk>> {
        self.counters.enter();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = match &self.failure {
            Some(f) if f.after_chunks == self.delivered => {
                let error = f.error.clone();
                self.failure = None;
                Err(error)
            }
            _ => {
                let next = self.chunks.pop_front();
                if next.is_some() {
                    self.delivered += 1;
                }
                Ok(next)
            }
        };
        self.counters.leave();
        result
    }
}

struct MemoryHourlyStream {
    batch: Option<Vec<HourlyRow>>,
    counters: Arc<Counters>,
}

#[async_trait]
impl HourlyStream for MemoryHourlyStream {
    async fn next_batch(&mut self) -> SourceResult<Option<Vec<HourlyRow>>> {
        self.counters.enter();
        let batch = self.batch.take();
        self.counters.leave();
        Ok(batch)
    }
}

#[async_trait]
impl ExternalDataSource for InMemorySource {
    async fn stream_daily(
        &self,
        site_url: &str,
        date: NaiveDate,
    ) -> SourceResult<Box<dyn DailyStream>> {
        let key = (normalize_domain(site_url), date);
        self.counters.enter();
        self.simulate_latency().await;
        self.opened.lock().await.push(key.clone());

        let failure = self
            .failures
            .lock()
            .await
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());

        let result = match failure {
            Some(f) if f.after_chunks == 0 => Err(f.error),
            failure => Ok(Box::new(MemoryDailyStream {
                chunks: self.daily.get(&key).cloned().unwrap_or_default().into(),
                delivered: 0,
                failure,
                latency: self.latency,
                counters: Arc::clone(&self.counters),
            }) as Box<dyn DailyStream>),
        };
        self.counters.leave();
        result
    }

    async fn stream_hourly(
        &self,
        site_url: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> SourceResult<Box<dyn HourlyStream>> {
        self.counters.enter();
        self.simulate_latency().await;
        let rows: Vec<HourlyRow> = self
            .hourly
            .get(&normalize_domain(site_url))
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.date >= start && r.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.counters.leave();
        Ok(Box::new(MemoryHourlyStream {
            batch: (!rows.is_empty()).then_some(rows),
            counters: Arc::clone(&self.counters),
        }))
    }
}
