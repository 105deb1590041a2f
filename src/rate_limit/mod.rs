//! Quota enforcement for the external reporting API.
//!
//! The external API allows a fixed number of requests per rolling minute and
//! an advisory number per day. [`RateLimiter`] enforces the per-minute ceiling
//! by sleeping and tracks the daily count, persisting it through a pluggable
//! [`UsageStore`]:
//! - In-memory (tests, throw-away jobs)
//! - SQLite (survives restarts so a new process does not under-count)

mod backend;
mod config;
mod limiter;
mod memory;
mod sqlite;

pub use backend::{RateLimitError, RateLimitResult, UsageStore};
pub use config::{RateLimitConfig, UsageSnapshot};
pub use limiter::{BoxedUsageStore, RateLimiter};
pub use memory::InMemoryUsageStore;
pub use sqlite::{SqliteUsageStore, UsageDay};
