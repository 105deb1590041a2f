//! Storage summary statistics.

use chrono::NaiveDate;
use serde::Serialize;

use super::{Result, StorageEngine};

/// Snapshot of what the row store holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStats {
    pub sites: u64,
    pub active_sites: u64,
    pub daily_rows: u64,
    pub hourly_rows: u64,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    /// Size of the main database file in bytes (WAL excluded).
    pub file_size: u64,
}

impl StorageEngine {
    /// Summarise the store contents.
    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.reader()?;

        let (sites, active_sites): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_active), 0) FROM sites",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (daily_rows, first_date, last_date): (i64, Option<NaiveDate>, Option<NaiveDate>) = conn
            .query_row(
                "SELECT COUNT(*), MIN(date), MAX(date) FROM performance_data",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
        let hourly_rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM hourly_data", [], |row| row.get(0))?;

        let file_size = std::fs::metadata(self.path()).map(|m| m.len()).unwrap_or(0);

        Ok(StorageStats {
            sites: sites as u64,
            active_sites: active_sites as u64,
            daily_rows: daily_rows as u64,
            hourly_rows: hourly_rows as u64,
            first_date,
            last_date,
            file_size,
        })
    }
}
