//! Data models for sitestats.

mod insert;
mod record;
mod site;

pub use insert::{InsertMode, InsertStats};
pub use record::{HourlyRecord, PerformanceRecord};
pub use site::{normalize_domain, Site, DEFAULT_CATEGORY};
