//! SQLite-backed usage store.
//!
//! One row per UTC date in `api_usage`. The table can live in the main row
//! store file; it uses its own connection and never touches analytics tables.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::debug;

use super::backend::{RateLimitResult, UsageStore};

/// Open a database connection with proper concurrency settings.
fn open_db(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 30000;
    "#,
    )?;
    Ok(conn)
}

/// Initialize the usage table in the database.
pub fn init_usage_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS api_usage (
            date TEXT PRIMARY KEY,
            request_count INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );
    "#,
    )?;
    Ok(())
}

/// Requests recorded on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageDay {
    pub date: NaiveDate,
    pub request_count: u64,
}

#[derive(Debug, Clone)]
pub struct SqliteUsageStore {
    db_path: PathBuf,
}

impl SqliteUsageStore {
    /// Open the store, creating the usage table if needed.
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        let conn = open_db(db_path)?;
        init_usage_table(&conn)?;
        debug!(path = %db_path.display(), "Usage store ready");
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    /// Usage for the last `days` days including today, newest first.
    /// Days without requests are omitted.
    pub fn history(&self, days: u32) -> anyhow::Result<Vec<UsageDay>> {
        let conn = open_db(&self.db_path)?;
        let since = Utc::now().date_naive() - Duration::days(i64::from(days.saturating_sub(1)));
        let mut stmt = conn.prepare(
            "SELECT date, request_count FROM api_usage WHERE date >= ? ORDER BY date DESC",
        )?;
        let rows = stmt
            .query_map(params![since], |row| {
                Ok(UsageDay {
                    date: row.get(0)?,
                    request_count: row.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn load(&self, date: NaiveDate) -> RateLimitResult<u64> {
        let conn = open_db(&self.db_path)?;
        let count: Option<i64> = match conn.query_row(
            "SELECT request_count FROM api_usage WHERE date = ?",
            params![date],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(count.unwrap_or(0) as u64)
    }

    async fn increment(&self, date: NaiveDate) -> RateLimitResult<u64> {
        let conn = open_db(&self.db_path)?;
        let count: i64 = conn.query_row(
            r#"
            INSERT INTO api_usage (date, request_count, updated_at)
            VALUES (?1, 1, ?2)
            ON CONFLICT(date) DO UPDATE SET
                request_count = request_count + 1,
                updated_at = excluded.updated_at
            RETURNING request_count
            "#,
            params![date, Utc::now().to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_counts_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.db");
        let today = Utc::now().date_naive();

        let store = SqliteUsageStore::open(&path).unwrap();
        store.increment(today).await.unwrap();
        store.increment(today).await.unwrap();

        let reopened = SqliteUsageStore::open(&path).unwrap();
        assert_eq!(reopened.load(today).await.unwrap(), 2);
        assert_eq!(reopened.increment(today).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_history_orders_newest_first() {
        let dir = tempdir().unwrap();
        let store = SqliteUsageStore::open(&dir.path().join("usage.db")).unwrap();
        let today = Utc::now().date_naive();
        let yesterday = today - Duration::days(1);
        let long_ago = today - Duration::days(30);

        store.increment(yesterday).await.unwrap();
        store.increment(today).await.unwrap();
        store.increment(today).await.unwrap();
        store.increment(long_ago).await.unwrap();

        let history = store.history(7).unwrap();
        assert_eq!(
            history,
            vec![
                UsageDay { date: today, request_count: 2 },
                UsageDay { date: yesterday, request_count: 1 },
            ]
        );
    }
}
