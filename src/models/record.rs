//! Performance records ingested from the external reporting API.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One row of daily search performance.
///
/// Natural key: `(site_id, date, page, query, device, search_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub site_id: i64,
    pub date: NaiveDate,
    pub page: String,
    pub query: String,
    pub device: String,
    pub search_type: String,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
    pub position: f64,
}

impl PerformanceRecord {
    /// Natural key as a tuple of borrowed fields.
    pub fn natural_key(&self) -> (i64, NaiveDate, &str, &str, &str, &str) {
        (
            self.site_id,
            self.date,
            &self.page,
            &self.query,
            &self.device,
            &self.search_type,
        )
    }
}

/// One row of hourly search performance.
///
/// Natural key: `(site_id, date, hour, query, page)`. Only a short trailing
/// window of hourly data exists upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyRecord {
    pub site_id: i64,
    pub date: NaiveDate,
    /// Hour of day, 0-23.
    pub hour: u8,
    pub query: String,
    pub page: String,
    pub position: f64,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
}

impl HourlyRecord {
    pub fn natural_key(&self) -> (i64, NaiveDate, u8, &str, &str) {
        (self.site_id, self.date, self.hour, &self.query, &self.page)
    }

    /// Whether the hour field is within 0-23.
    pub fn has_valid_hour(&self) -> bool {
        self.hour < 24
    }
}
