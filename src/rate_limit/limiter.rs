//! Sliding-window rate limiter with a persisted daily counter.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::backend::UsageStore;
use super::config::{RateLimitConfig, UsageSnapshot};

/// Type alias for a shared usage store.
pub type BoxedUsageStore = Arc<dyn UsageStore>;

fn utc_today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Rate limiter for a single sequential caller.
///
/// Owned by the job that issues external requests; no process-wide state.
/// Persistence failures never propagate: the in-memory counters keep working
/// and a warning is logged.
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Send instants inside the current window, oldest first.
    window: VecDeque<Instant>,
    today: NaiveDate,
    daily_count: u64,
    daily_warned: bool,
    store: Option<BoxedUsageStore>,
    clock: fn() -> NaiveDate,
}

impl RateLimiter {
    /// Create a limiter without persistence.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            today: utc_today(),
            daily_count: 0,
            daily_warned: false,
            store: None,
            clock: utc_today,
        }
    }

    /// Create a limiter backed by `store`, seeding today's count from it.
    pub async fn with_store(config: RateLimitConfig, store: BoxedUsageStore) -> Self {
        let mut limiter = Self::new(config);
        limiter.store = Some(store);
        limiter.reload_daily().await;
        limiter
    }

    /// Override the source of "today". Used to exercise day rollover.
    pub fn with_clock(mut self, clock: fn() -> NaiveDate) -> Self {
        self.clock = clock;
        self.today = clock();
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    async fn reload_daily(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.load(self.today).await {
            Ok(count) => {
                if count > 0 {
                    info!(date = %self.today, count, "Resuming daily API usage count");
                }
                self.daily_count = count;
            }
            Err(e) => warn!(error = %e, "Failed to load daily API usage, starting from zero"),
        }
    }

    async fn roll_date(&mut self) {
        let today = (self.clock)();
        if today != self.today {
            debug!(from = %self.today, to = %today, "Daily usage counter rolled over");
            self.today = today;
            self.daily_count = 0;
            self.daily_warned = false;
            self.reload_daily().await;
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.window.front() {
            if now.duration_since(oldest) >= self.config.window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Wait until one more request fits in the sliding window.
    ///
    /// Never fails. The daily quota is advisory: reaching it logs a warning
    /// once per day and does not block.
    pub async fn check_and_wait(&mut self) {
        self.roll_date().await;

        if self.config.requests_per_minute > 0 {
            let ceiling = self.config.requests_per_minute as usize;
            loop {
                self.prune(Instant::now());
                if self.window.len() < ceiling {
                    break;
                }
                let Some(&oldest) = self.window.front() else {
                    break;
                };
                let until = oldest + self.config.window;
                debug!(
                    wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                    in_window = self.window.len(),
                    "Per-minute ceiling reached, waiting"
                );
                sleep_until(until).await;
            }
        }

        if self.daily_count >= self.config.requests_per_day && !self.daily_warned {
            warn!(
                date = %self.today,
                count = self.daily_count,
                limit = self.config.requests_per_day,
                "Daily API quota reached; continuing because the daily limit is advisory"
            );
            self.daily_warned = true;
        }
    }

    /// Record that a request was sent.
    pub async fn record_request(&mut self) {
        self.roll_date().await;
        self.window.push_back(Instant::now());
        self.daily_count += 1;

        if let Some(store) = &self.store {
            match store.increment(self.today).await {
                // Another process may share the counter
                Ok(persisted) => self.daily_count = self.daily_count.max(persisted),
                Err(e) => warn!(error = %e, "Failed to persist API usage, using in-memory count"),
            }
        }
    }

    /// Current usage figures.
    pub fn usage_snapshot(&self) -> UsageSnapshot {
        let now = Instant::now();
        let minute_count = self
            .window
            .iter()
            .filter(|&&t| now.duration_since(t) < self.config.window)
            .count() as u32;
        UsageSnapshot {
            date: self.today,
            minute_count,
            minute_limit: self.config.requests_per_minute,
            daily_count: self.daily_count,
            daily_limit: self.config.requests_per_day,
            daily_remaining: self.config.requests_per_day.saturating_sub(self.daily_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::backend::{RateLimitError, RateLimitResult};
    use crate::rate_limit::InMemoryUsageStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FailingStore;

    #[async_trait]
    impl UsageStore for FailingStore {
        async fn load(&self, _date: NaiveDate) -> RateLimitResult<u64> {
            Err(RateLimitError::Unavailable("down".into()))
        }

        async fn increment(&self, _date: NaiveDate) -> RateLimitResult<u64> {
            Err(RateLimitError::Unavailable("down".into()))
        }
    }

    fn config(per_minute: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: per_minute,
            requests_per_day: 5,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_window_exceeds_ceiling() {
        let mut limiter = RateLimiter::new(config(3));
        let start = Instant::now();
        let mut sent = Vec::new();

        for _ in 0..10 {
            limiter.check_and_wait().await;
            limiter.record_request().await;
            sent.push(Instant::now());
        }

        for (i, t) in sent.iter().enumerate() {
            let in_window = sent[i..]
                .iter()
                .filter(|&&u| u.duration_since(*t) < Duration::from_secs(60))
                .count();
            assert!(in_window <= 3, "window starting at request {i} has {in_window}");
        }
        // 10 requests at 3 per minute need three full waits
        assert!(Instant::now().duration_since(start) >= Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_below_ceiling() {
        let mut limiter = RateLimiter::new(config(5));
        let start = Instant::now();
        for _ in 0..5 {
            limiter.check_and_wait().await;
            limiter.record_request().await;
        }
        assert_eq!(Instant::now(), start);
        assert_eq!(limiter.usage_snapshot().minute_count, 5);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_not_fatal() {
        let mut limiter = RateLimiter::with_store(config(0), Arc::new(FailingStore)).await;
        for _ in 0..3 {
            limiter.check_and_wait().await;
            limiter.record_request().await;
        }
        assert_eq!(limiter.usage_snapshot().daily_count, 3);
    }

    #[tokio::test]
    async fn test_daily_count_resumes_from_store() {
        let store: BoxedUsageStore = Arc::new(InMemoryUsageStore::new());
        let today = utc_today();
        store.increment(today).await.unwrap();
        store.increment(today).await.unwrap();

        let mut limiter = RateLimiter::with_store(config(0), Arc::clone(&store)).await;
        assert_eq!(limiter.usage_snapshot().daily_count, 2);

        for _ in 0..4 {
            limiter.check_and_wait().await;
            limiter.record_request().await;
        }
        let snapshot = limiter.usage_snapshot();
        assert_eq!(snapshot.daily_count, 6);
        assert_eq!(snapshot.daily_remaining, 0);
        assert_eq!(store.load(today).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_day_rollover_resets_count() {
        fn fixed_day() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        }
        fn next_day() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
        }

        let mut limiter = RateLimiter::new(config(0)).with_clock(fixed_day);
        limiter.record_request().await;
        limiter.record_request().await;
        assert_eq!(limiter.usage_snapshot().daily_count, 2);

        limiter.clock = next_day;
        limiter.check_and_wait().await;
        let snapshot = limiter.usage_snapshot();
        assert_eq!(snapshot.date, next_day());
        assert_eq!(snapshot.daily_count, 0);
    }
}
