//! Two-phase batch insert with explicit conflict accounting.
//!
//! Phase one writes the whole batch with multi-row statements inside a
//! savepoint. If any statement hits a constraint violation the savepoint is
//! rolled back and phase two retries row by row, classifying each failure:
//! natural-key conflicts are skipped rows, other constraint violations are
//! failed rows. Any non-constraint error aborts the operation.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, ErrorCode};
use tracing::{debug, warn};

use super::{RepositoryError, Result, StorageEngine};
use crate::models::{HourlyRecord, InsertMode, InsertStats, PerformanceRecord};

/// Upper bound on bound parameters per statement.
const MAX_VARIABLES: usize = 32_000;

/// Upper bound on rows per multi-row statement.
const MAX_ROWS_PER_STATEMENT: usize = 500;

/// A record type that maps onto one row-store table.
pub trait Insertable {
    /// Target table.
    const TABLE: &'static str;
    /// Columns in bind order.
    const COLUMNS: &'static [&'static str];
    /// Natural-key columns (a subset of `COLUMNS`).
    const KEY_COLUMNS: &'static [&'static str];

    /// Partition the row belongs to: `(site_id, date)`.
    fn partition(&self) -> (i64, NaiveDate);

    /// Push this row's values in `COLUMNS` order.
    fn bind<'a>(&'a self, out: &mut Vec<&'a dyn ToSql>);

    /// Rough in-memory footprint, used by the buffered writer.
    fn estimated_size(&self) -> usize;
}

impl Insertable for PerformanceRecord {
    const TABLE: &'static str = "performance_data";
    const COLUMNS: &'static [&'static str] = &[
        "site_id",
        "date",
        "page",
        "query",
        "device",
        "search_type",
        "clicks",
        "impressions",
        "ctr",
        "position",
    ];
    const KEY_COLUMNS: &'static [&'static str] =
        &["site_id", "date", "page", "query", "device", "search_type"];

    fn partition(&self) -> (i64, NaiveDate) {
        (self.site_id, self.date)
    }

    fn bind<'a>(&'a self, out: &mut Vec<&'a dyn ToSql>) {
        out.push(&self.site_id);
        out.push(&self.date);
        out.push(&self.page);
        out.push(&self.query);
        out.push(&self.device);
        out.push(&self.search_type);
        out.push(&self.clicks);
        out.push(&self.impressions);
        out.push(&self.ctr);
        out.push(&self.position);
    }

    fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.page.capacity()
            + self.query.capacity()
            + self.device.capacity()
            + self.search_type.capacity()
    }
}

impl Insertable for HourlyRecord {
    const TABLE: &'static str = "hourly_data";
    const COLUMNS: &'static [&'static str] = &[
        "site_id",
        "date",
        "hour",
        "query",
        "page",
        "position",
        "clicks",
        "impressions",
        "ctr",
    ];
    const KEY_COLUMNS: &'static [&'static str] = &["site_id", "date", "hour", "query", "page"];

    fn partition(&self) -> (i64, NaiveDate) {
        (self.site_id, self.date)
    }

    fn bind<'a>(&'a self, out: &mut Vec<&'a dyn ToSql>) {
        out.push(&self.site_id);
        out.push(&self.date);
        out.push(&self.hour);
        out.push(&self.query);
        out.push(&self.page);
        out.push(&self.position);
        out.push(&self.clicks);
        out.push(&self.impressions);
        out.push(&self.ctr);
    }

    fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.query.capacity() + self.page.capacity()
    }
}

/// How a failed single-row statement is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowFailure {
    /// Natural key already present.
    Conflict,
    /// Some other constraint rejected the row (CHECK, NOT NULL, FOREIGN KEY).
    Rejected,
}

fn classify(err: &rusqlite::Error) -> Option<RowFailure> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            match e.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => Some(RowFailure::Conflict),
                _ => Some(RowFailure::Rejected),
            }
        }
        _ => None,
    }
}

fn is_constraint_violation(err: &RepositoryError) -> bool {
    matches!(err, RepositoryError::Database(e) if classify(e).is_some())
}

/// Build the insert statement for `rows` rows in the given mode.
fn insert_sql<R: Insertable>(rows: usize, mode: InsertMode) -> String {
    let placeholders = format!("({})", vec!["?"; R::COLUMNS.len()].join(", "));
    let values = vec![placeholders; rows].join(", ");
    let columns = R::COLUMNS.join(", ");

    match mode {
        InsertMode::Skip => format!("INSERT INTO {} ({}) VALUES {}", R::TABLE, columns, values),
        InsertMode::Overwrite => {
            let updates = R::COLUMNS
                .iter()
                .filter(|c| !R::KEY_COLUMNS.contains(c))
                .map(|c| format!("{c} = excluded.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {} ({}) VALUES {} ON CONFLICT({}) DO UPDATE SET {}",
                R::TABLE,
                columns,
                values,
                R::KEY_COLUMNS.join(", "),
                updates
            )
        }
    }
}

fn rows_per_statement<R: Insertable>() -> usize {
    (MAX_VARIABLES / R::COLUMNS.len()).clamp(1, MAX_ROWS_PER_STATEMENT)
}

/// Phase one: write every row with multi-row statements.
fn write_batch<R: Insertable>(conn: &Connection, records: &[R], mode: InsertMode) -> Result<()> {
    for chunk in records.chunks(rows_per_statement::<R>()) {
        let sql = insert_sql::<R>(chunk.len(), mode);
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() * R::COLUMNS.len());
        for record in chunk {
            record.bind(&mut values);
        }
        stmt.execute(values.as_slice())?;
    }
    Ok(())
}

/// Phase two: write rows one at a time, returning (written, conflicts, rejected).
fn write_rows<R: Insertable>(
    conn: &Connection,
    records: &[R],
    mode: InsertMode,
) -> Result<(u64, u64, u64)> {
    let sql = insert_sql::<R>(1, mode);
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut written = 0;
    let mut conflicts = 0;
    let mut rejected = 0;

    for record in records {
        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(R::COLUMNS.len());
        record.bind(&mut values);
        match stmt.execute(values.as_slice()) {
            Ok(_) => written += 1,
            Err(e) => match classify(&e) {
                Some(RowFailure::Conflict) => conflicts += 1,
                Some(RowFailure::Rejected) => {
                    debug!(table = R::TABLE, error = %e, "Row rejected by constraint");
                    rejected += 1;
                }
                None => return Err(e.into()),
            },
        }
    }

    Ok((written, conflicts, rejected))
}

/// Row count per partition touched by `records`.
fn partition_rows<R: Insertable>(conn: &Connection, records: &[R]) -> Result<u64> {
    let partitions: BTreeSet<(i64, NaiveDate)> = records.iter().map(|r| r.partition()).collect();
    let sql = format!("SELECT COUNT(*) FROM {} WHERE site_id = ? AND date = ?", R::TABLE);
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut total = 0u64;
    for (site_id, date) in partitions {
        let count: i64 = stmt.query_row(params![site_id, date], |row| row.get(0))?;
        total += count as u64;
    }
    Ok(total)
}

/// Insert `records` on an open transaction.
///
/// Must be called with the write lock held.
pub(crate) fn insert_records<R: Insertable>(
    conn: &Connection,
    records: &[R],
    mode: InsertMode,
) -> Result<InsertStats> {
    if records.is_empty() {
        return Ok(InsertStats::default());
    }

    let before = match mode {
        InsertMode::Skip => 0,
        InsertMode::Overwrite => partition_rows(conn, records)?,
    };

    conn.execute_batch("SAVEPOINT batch_insert")?;
    let batch_result = write_batch(conn, records, mode);
    let (written, conflicts, rejected) = match batch_result {
        Ok(()) => {
            conn.execute_batch("RELEASE batch_insert")?;
            (records.len() as u64, 0, 0)
        }
        Err(e) if is_constraint_violation(&e) => {
            debug!(
                table = R::TABLE,
                rows = records.len(),
                error = %e,
                "Batch insert hit a constraint, falling back to per-row insert"
            );
            conn.execute_batch("ROLLBACK TO batch_insert; RELEASE batch_insert")?;
            write_rows(conn, records, mode)?
        }
        Err(e) => {
            conn.execute_batch("ROLLBACK TO batch_insert; RELEASE batch_insert")?;
            return Err(e);
        }
    };

    let stats = match mode {
        InsertMode::Skip => InsertStats {
            inserted: written,
            updated: 0,
            skipped: conflicts,
            failed: rejected,
        },
        InsertMode::Overwrite => {
            let after = partition_rows(conn, records)?;
            let inserted = after.saturating_sub(before).min(written);
            InsertStats {
                inserted,
                updated: written - inserted,
                skipped: conflicts,
                failed: rejected,
            }
        }
    };

    if stats.failed > 0 {
        warn!(table = R::TABLE, failed = stats.failed, "Rows rejected during insert");
    }

    Ok(stats)
}

impl StorageEngine {
    /// Insert a batch of records under the given mode.
    ///
    /// `Skip` keeps existing rows and counts duplicates as skipped.
    /// `Overwrite` upserts; pair it with [`StorageEngine::delete_for_day`] or
    /// use [`StorageEngine::replace_day`] to replace a day atomically.
    pub fn insert_batch<R: Insertable>(
        &self,
        records: &[R],
        mode: InsertMode,
    ) -> Result<InsertStats> {
        if records.is_empty() {
            return Ok(InsertStats::default());
        }
        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            let stats = insert_records(&tx, records, mode)?;
            tx.commit()?;
            debug!(table = R::TABLE, mode = %mode, %stats, "Batch written");
            Ok(stats)
        })
    }

    /// Delete every daily row for one `(site, date)` partition.
    pub fn delete_for_day(&self, site_id: i64, date: NaiveDate) -> Result<u64> {
        self.with_writer(|conn| {
            let deleted = conn.execute(
                "DELETE FROM performance_data WHERE site_id = ? AND date = ?",
                params![site_id, date],
            )?;
            Ok(deleted as u64)
        })
    }

    /// Replace a day's rows: delete the partition, insert every chunk, commit.
    ///
    /// Readers see either the old day or the new day, never a mix. Returns
    /// one stats entry per chunk.
    pub fn replace_day(
        &self,
        site_id: i64,
        date: NaiveDate,
        chunks: &[Vec<PerformanceRecord>],
    ) -> Result<Vec<InsertStats>> {
        if let Some(stray) = chunks
            .iter()
            .flatten()
            .find(|r| r.site_id != site_id || r.date != date)
        {
            return Err(RepositoryError::InvalidData(format!(
                "record for ({}, {}) in replace of ({}, {})",
                stray.site_id, stray.date, site_id, date
            )));
        }

        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute(
                "DELETE FROM performance_data WHERE site_id = ? AND date = ?",
                params![site_id, date],
            )?;
            let mut per_chunk = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                per_chunk.push(insert_records(&tx, chunk, InsertMode::Overwrite)?);
            }
            tx.commit()?;
            debug!(site_id, %date, deleted, chunks = chunks.len(), "Day replaced");
            Ok(per_chunk)
        })
    }

    /// Replace hourly rows for `site_id` in `[start, end]` atomically.
    pub fn replace_hourly_range(
        &self,
        site_id: i64,
        start: NaiveDate,
        end: NaiveDate,
        records: &[HourlyRecord],
    ) -> Result<InsertStats> {
        if let Some(stray) = records
            .iter()
            .find(|r| r.site_id != site_id || r.date < start || r.date > end)
        {
            return Err(RepositoryError::InvalidData(format!(
                "hourly record for ({}, {}) outside replace range",
                stray.site_id, stray.date
            )));
        }

        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM hourly_data WHERE site_id = ? AND date BETWEEN ? AND ?",
                params![site_id, start, end],
            )?;
            let stats = insert_records(&tx, records, InsertMode::Overwrite)?;
            tx.commit()?;
            Ok(stats)
        })
    }

    /// Number of daily rows stored for one partition.
    pub fn count_for_day(&self, site_id: i64, date: NaiveDate) -> Result<u64> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM performance_data WHERE site_id = ? AND date = ?",
            params![site_id, date],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Every daily row stored for one partition, ordered by natural key.
    pub fn records_for_day(&self, site_id: i64, date: NaiveDate) -> Result<Vec<PerformanceRecord>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT site_id, date, page, query, device, search_type,
                   clicks, impressions, ctr, position
            FROM performance_data
            WHERE site_id = ? AND date = ?
            ORDER BY page, query, device, search_type
        "#,
        )?;
        let records = stmt
            .query_map(params![site_id, date], |row| {
                Ok(PerformanceRecord {
                    site_id: row.get(0)?,
                    date: row.get(1)?,
                    page: row.get(2)?,
                    query: row.get(3)?,
                    device: row.get(4)?,
                    search_type: row.get(5)?,
                    clicks: row.get(6)?,
                    impressions: row.get(7)?,
                    ctr: row.get(8)?,
                    position: row.get(9)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}
