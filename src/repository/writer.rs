//! Buffered writer that groups small inserts into larger batches.
//!
//! Records accumulate in memory until one of three triggers fires: the row
//! count reaches the batch size, the estimated buffer size reaches the memory
//! cap, or the flush interval has elapsed since the last flush. A background
//! ticker can drive the interval trigger for writers that go quiet.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{Insertable, RepositoryError, Result, StorageEngine};
use crate::models::{InsertMode, InsertStats};
use crate::shutdown::SharedShutdown;

/// Flush triggers for a [`BufferedWriter`].
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush once this many rows are buffered.
    pub batch_size: usize,
    /// Flush once this much time has passed since the last flush.
    pub flush_interval: Duration,
    /// Flush once the estimated buffer footprint reaches this many bytes.
    pub max_memory_bytes: usize,
    /// Insert policy applied on flush.
    pub mode: InsertMode,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval: Duration::from_secs(30),
            max_memory_bytes: 64 * 1024 * 1024,
            mode: InsertMode::Skip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Empty,
    Accumulating,
    Flushing,
    Closed,
}

pub struct BufferedWriter<R: Insertable> {
    engine: Arc<StorageEngine>,
    config: WriterConfig,
    buffer: Vec<R>,
    buffered_bytes: usize,
    last_flush: Instant,
    state: WriterState,
    stats: InsertStats,
    flushes: u64,
}

impl<R: Insertable> BufferedWriter<R> {
    pub fn new(engine: Arc<StorageEngine>, config: WriterConfig) -> Self {
        let capacity = config.batch_size.min(10_000);
        Self {
            engine,
            config,
            buffer: Vec::with_capacity(capacity),
            buffered_bytes: 0,
            last_flush: Instant::now(),
            state: WriterState::Empty,
            stats: InsertStats::default(),
            flushes: 0,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Rows currently waiting for a flush.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Accounting accumulated over every flush so far.
    pub fn stats(&self) -> InsertStats {
        self.stats
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Buffer one record, flushing if a trigger fires.
    pub fn add(&mut self, record: R) -> Result<Option<InsertStats>> {
        self.push(record)?;
        self.flush_if_due()
    }

    /// Buffer many records, flushing as often as the triggers demand.
    pub fn add_batch(&mut self, records: impl IntoIterator<Item = R>) -> Result<InsertStats> {
        let mut flushed = InsertStats::default();
        for record in records {
            self.push(record)?;
            if let Some(stats) = self.flush_if_due()? {
                flushed += stats;
            }
        }
        Ok(flushed)
    }

    /// Flush whatever is buffered.
    ///
    /// On failure the buffer is kept so the caller may retry.
    pub fn flush(&mut self) -> Result<InsertStats> {
        if self.state == WriterState::Closed {
            return Err(RepositoryError::WriterClosed);
        }
        self.flush_inner()
    }

    /// Flush if the interval has elapsed. Meant to be called periodically.
    pub fn tick(&mut self) -> Result<Option<InsertStats>> {
        if self.state != WriterState::Accumulating {
            return Ok(None);
        }
        if self.last_flush.elapsed() >= self.config.flush_interval {
            return self.flush_inner().map(Some);
        }
        Ok(None)
    }

    /// Flush remaining rows and refuse further writes.
    pub fn close(&mut self) -> Result<InsertStats> {
        if self.state == WriterState::Closed {
            return Ok(self.stats);
        }
        self.flush_inner()?;
        self.state = WriterState::Closed;
        debug!(flushes = self.flushes, stats = %self.stats, "Buffered writer closed");
        Ok(self.stats)
    }

    fn push(&mut self, record: R) -> Result<()> {
        if self.state == WriterState::Closed {
            return Err(RepositoryError::WriterClosed);
        }
        self.buffered_bytes += record.estimated_size();
        self.buffer.push(record);
        self.state = WriterState::Accumulating;
        Ok(())
    }

    fn flush_if_due(&mut self) -> Result<Option<InsertStats>> {
        let due = self.buffer.len() >= self.config.batch_size
            || self.buffered_bytes >= self.config.max_memory_bytes
            || self.last_flush.elapsed() >= self.config.flush_interval;
        if due {
            self.flush_inner().map(Some)
        } else {
            Ok(None)
        }
    }

    fn flush_inner(&mut self) -> Result<InsertStats> {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return Ok(InsertStats::default());
        }

        self.state = WriterState::Flushing;
        match self.engine.insert_batch(&self.buffer, self.config.mode) {
            Ok(stats) => {
                debug!(table = R::TABLE, rows = self.buffer.len(), %stats, "Flushed buffer");
                self.buffer.clear();
                self.buffered_bytes = 0;
                self.last_flush = Instant::now();
                self.stats += stats;
                self.flushes += 1;
                self.state = WriterState::Empty;
                Ok(stats)
            }
            Err(e) => {
                self.state = WriterState::Accumulating;
                Err(e)
            }
        }
    }
}

/// Drive the interval trigger of a shared writer until shutdown.
///
/// Flushes run on the blocking pool while the writer lock is held. The
/// writer is closed when shutdown is requested.
pub fn spawn_flush_ticker<R>(
    writer: Arc<Mutex<BufferedWriter<R>>>,
    period: Duration,
    shutdown: SharedShutdown,
) -> JoinHandle<()>
where
    R: Insertable + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut guard = Arc::clone(&writer).lock_owned().await;
                    match tokio::task::spawn_blocking(move || guard.tick()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "Periodic flush failed"),
                        Err(e) => warn!(error = %e, "Periodic flush task failed"),
                    }
                }
                _ = shutdown.wait_for_shutdown() => {
                    let mut guard = Arc::clone(&writer).lock_owned().await;
                    match tokio::task::spawn_blocking(move || guard.close()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "Final flush failed"),
                        Err(e) => warn!(error = %e, "Final flush task failed"),
                    }
                    break;
                }
            }
        }
    })
}
