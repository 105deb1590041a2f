//! sitestats - quota-aware search analytics sync engine.
//!
//! Pulls daily and hourly search performance data from a rate-limited
//! external reporting API into a local SQLite store, one site-day at a time,
//! with resumable checkpoints and an optional DuckDB engine for aggregation
//! queries.

#![allow(clippy::should_implement_trait)]

pub mod config;
pub mod logging;
pub mod models;
pub mod rate_limit;
pub mod repository;
pub mod shutdown;
pub mod source;
pub mod state;
pub mod sync;

pub use config::{load_settings, Config, LoadOptions, Settings};
pub use models::{HourlyRecord, InsertMode, InsertStats, PerformanceRecord, Site};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use repository::{RepositoryError, StorageEngine, StorageOptions};
pub use shutdown::{SharedShutdown, ShutdownCoordinator};
pub use source::{ExternalDataSource, InMemorySource, SourceError};
pub use state::{StateManager, SyncCheckpoint};
pub use sync::{SyncError, SyncOptions, SyncOrchestrator, SyncSummary};
