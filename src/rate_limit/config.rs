//! Rate limiter configuration and usage reporting types.

use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;

/// Length of the sliding window the per-minute ceiling applies to.
pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Hard ceiling per sliding window. Zero disables the ceiling.
    pub requests_per_minute: u32,
    /// Advisory daily quota. Exceeding it only logs a warning.
    pub requests_per_day: u64,
    /// Sliding window length; 60 s outside of tests.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 1200,
            requests_per_day: 30_000,
            window: MINUTE_WINDOW,
        }
    }
}

/// Point-in-time view of API usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub date: NaiveDate,
    /// Requests inside the current sliding window.
    pub minute_count: u32,
    pub minute_limit: u32,
    pub daily_count: u64,
    pub daily_limit: u64,
    /// Requests left in the advisory daily quota.
    pub daily_remaining: u64,
}
