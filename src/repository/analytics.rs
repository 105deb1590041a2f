//! Read-side analytics over the row store.
//!
//! With the `duckdb` feature enabled, an in-memory DuckDB instance attaches the
//! SQLite file read-only and runs the aggregation and window-function queries,
//! so there is one copy of the data and no replication step. When DuckDB is not
//! compiled in, is disabled, or fails to attach, the same queries run on a
//! plain SQLite read connection. A DuckDB query that fails at run time is
//! retried once on SQLite.

use std::path::{Path, PathBuf};
#[cfg(feature = "duckdb")]
use std::sync::Mutex;

use chrono::NaiveDate;
use rusqlite::types::Value as SqliteValue;
use serde::{Deserialize, Serialize};
#[cfg(feature = "duckdb")]
use tracing::{info, warn};

use super::{connect, parse_date, RepositoryError, Result};

/// Options for the analytical engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsOptions {
    /// Use DuckDB when compiled in. Ignored without the `duckdb` feature.
    pub prefer_duckdb: bool,
    /// DuckDB `memory_limit` setting, e.g. `"1GB"`.
    pub memory_limit: Option<String>,
}

impl Default for AnalyticsOptions {
    fn default() -> Self {
        Self {
            prefer_duckdb: true,
            memory_limit: None,
        }
    }
}

/// Which engine answers analytics queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnalyticsBackend {
    DuckDb,
    Sqlite,
}

/// Per-day aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyTotal {
    pub date: NaiveDate,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
    pub avg_position: f64,
}

/// Per-day totals with trailing moving averages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovingAveragePoint {
    pub date: NaiveDate,
    pub clicks: i64,
    pub impressions: i64,
    pub clicks_avg: f64,
    pub impressions_avg: f64,
}

/// Weekly totals with the change from the previous week.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeekOverWeek {
    /// Monday of the week.
    pub week_start: NaiveDate,
    pub clicks: i64,
    pub impressions: i64,
    pub previous_clicks: Option<i64>,
    pub previous_impressions: Option<i64>,
    /// Percentage change in clicks; `None` for the first week or when the
    /// previous week had no clicks.
    pub clicks_change_pct: Option<f64>,
}

/// A query or page ranked by clicks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedItem {
    pub rank: u32,
    pub key: String,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
    pub avg_position: f64,
}

/// Clicks and impressions summed per hour of day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyProfilePoint {
    pub hour: u8,
    pub clicks: i64,
    pub impressions: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Sqlite,
    #[cfg(feature = "duckdb")]
    DuckDb,
}

impl Dialect {
    fn table(self, name: &str) -> String {
        match self {
            Self::Sqlite => name.to_string(),
            #[cfg(feature = "duckdb")]
            Self::DuckDb => format!("store.{}", name),
        }
    }

    /// Monday of the week containing the ISO date column `col`.
    fn week_start(self, col: &str) -> String {
        match self {
            Self::Sqlite => format!("date({}, 'weekday 0', '-6 days')", col),
            #[cfg(feature = "duckdb")]
            Self::DuckDb => format!("CAST(date_trunc('week', CAST({} AS DATE)) AS DATE)", col),
        }
    }
}

/// Engine-neutral bound parameter.
#[derive(Debug, Clone)]
enum Arg {
    Int(i64),
    Text(String),
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<NaiveDate> for Arg {
    fn from(v: NaiveDate) -> Self {
        Self::Text(v.format("%Y-%m-%d").to_string())
    }
}

/// Engine-neutral result cell.
#[derive(Debug, Clone, PartialEq)]
enum Cell {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    fn int(&self) -> Result<i64> {
        match self {
            Self::Int(v) => Ok(*v),
            Self::Real(v) => Ok(*v as i64),
            Self::Null => Ok(0),
            Self::Text(s) => s
                .parse()
                .map_err(|_| {
                    RepositoryError::InvalidData(format!("expected integer, got '{}'", s))
                }),
        }
    }

    fn opt_int(&self) -> Result<Option<i64>> {
        match self {
            Self::Null => Ok(None),
            other => other.int().map(Some),
        }
    }

    fn real(&self) -> Result<f64> {
        match self {
            Self::Real(v) => Ok(*v),
            Self::Int(v) => Ok(*v as f64),
            Self::Null => Ok(0.0),
            Self::Text(s) => s
                .parse()
                .map_err(|_| RepositoryError::InvalidData(format!("expected number, got '{}'", s))),
        }
    }

    fn text(&self) -> Result<String> {
        match self {
            Self::Text(s) => Ok(s.clone()),
            Self::Int(v) => Ok(v.to_string()),
            Self::Real(v) => Ok(v.to_string()),
            Self::Null => Err(RepositoryError::InvalidData("unexpected NULL".to_string())),
        }
    }

    fn date(&self) -> Result<NaiveDate> {
        // DuckDB renders DATE casts as YYYY-MM-DD; SQLite stores ISO text
        let text = self.text()?;
        parse_date(text.get(..10).unwrap_or(&text))
    }
}

impl From<SqliteValue> for Cell {
    fn from(v: SqliteValue) -> Self {
        match v {
            SqliteValue::Null => Self::Null,
            SqliteValue::Integer(i) => Self::Int(i),
            SqliteValue::Real(f) => Self::Real(f),
            SqliteValue::Text(s) => Self::Text(s),
            SqliteValue::Blob(b) => Self::Text(String::from_utf8_lossy(&b).into_owned()),
        }
    }
}

#[cfg(feature = "duckdb")]
impl From<duckdb::types::Value> for Cell {
    fn from(v: duckdb::types::Value) -> Self {
        use duckdb::types::Value;
        match v {
            Value::Null => Self::Null,
            Value::Boolean(b) => Self::Int(b as i64),
            Value::TinyInt(i) => Self::Int(i as i64),
            Value::SmallInt(i) => Self::Int(i as i64),
            Value::Int(i) => Self::Int(i as i64),
            Value::BigInt(i) => Self::Int(i),
            Value::HugeInt(i) => Self::Int(i as i64),
            Value::UTinyInt(i) => Self::Int(i as i64),
            Value::USmallInt(i) => Self::Int(i as i64),
            Value::UInt(i) => Self::Int(i as i64),
            Value::UBigInt(i) => Self::Int(i as i64),
            Value::Float(f) => Self::Real(f as f64),
            Value::Double(f) => Self::Real(f),
            Value::Text(s) => Self::Text(s),
            other => Self::Text(format!("{:?}", other)),
        }
    }
}

fn ratio(clicks: i64, impressions: i64) -> f64 {
    if impressions > 0 {
        clicks as f64 / impressions as f64
    } else {
        0.0
    }
}

/// Read-side query engine over the row-store file.
pub struct AnalyticsEngine {
    db_path: PathBuf,
    #[cfg(feature = "duckdb")]
    duck: Option<Mutex<duckdb::Connection>>,
}

#[cfg(feature = "duckdb")]
fn attach_duckdb(db_path: &Path, options: &AnalyticsOptions) -> Result<duckdb::Connection> {
    let conn = duckdb::Connection::open_in_memory()?;
    if let Some(limit) = &options.memory_limit {
        conn.execute_batch(&format!("SET memory_limit = '{}'", limit.replace('\'', "''")))?;
    }
    conn.execute_batch("INSTALL sqlite; LOAD sqlite;")?;
    let path = db_path.to_string_lossy().replace('\'', "''");
    conn.execute_batch(&format!("ATTACH '{}' AS store (TYPE SQLITE, READ_ONLY)", path))?;
    Ok(conn)
}

impl AnalyticsEngine {
    /// Attach the analytical engine over `db_path`, falling back to SQLite.
    #[cfg(feature = "duckdb")]
    pub fn attach(db_path: &Path, options: &AnalyticsOptions) -> Self {
        let duck = if options.prefer_duckdb {
            match attach_duckdb(db_path, options) {
                Ok(conn) => {
                    info!(path = %db_path.display(), "DuckDB attached read-only");
                    Some(Mutex::new(conn))
                }
                Err(e) => {
                    warn!(error = %e, "DuckDB attach failed, analytics will use SQLite");
                    None
                }
            }
        } else {
            None
        };
        Self {
            db_path: db_path.to_path_buf(),
            duck,
        }
    }

    /// Attach the analytical engine over `db_path`.
    #[cfg(not(feature = "duckdb"))]
    pub fn attach(db_path: &Path, _options: &AnalyticsOptions) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
        }
    }

    pub fn backend(&self) -> AnalyticsBackend {
        #[cfg(feature = "duckdb")]
        if self.duck.is_some() {
            return AnalyticsBackend::DuckDb;
        }
        AnalyticsBackend::Sqlite
    }

    fn run_sqlite(&self, sql: &str, args: &[Arg], columns: usize) -> Result<Vec<Vec<Cell>>> {
        let conn = connect(&self.db_path)?;
        let mut stmt = conn.prepare(sql)?;
        let values: Vec<SqliteValue> = args
            .iter()
            .map(|a| match a {
                Arg::Int(i) => SqliteValue::Integer(*i),
                Arg::Text(s) => SqliteValue::Text(s.clone()),
            })
            .collect();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), |row| {
                (0..columns)
                    .map(|i| row.get::<_, SqliteValue>(i).map(Cell::from))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[cfg(feature = "duckdb")]
    fn run_duckdb(
        conn: &Mutex<duckdb::Connection>,
        sql: &str,
        args: &[Arg],
        columns: usize,
    ) -> Result<Vec<Vec<Cell>>> {
        use duckdb::types::Value;

        let conn = conn.lock().map_err(|_| RepositoryError::LockPoisoned)?;
        let mut stmt = conn.prepare(sql)?;
        let values: Vec<Value> = args
            .iter()
            .map(|a| match a {
                Arg::Int(i) => Value::BigInt(*i),
                Arg::Text(s) => Value::Text(s.clone()),
            })
            .collect();
        let rows = stmt
            .query_map(duckdb::params_from_iter(values), |row| {
                (0..columns)
                    .map(|i| row.get::<_, Value>(i).map(Cell::from))
                    .collect::<duckdb::Result<Vec<_>>>()
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Run a query built by `build` for the active dialect.
    fn run(
        &self,
        build: impl Fn(Dialect) -> String,
        args: &[Arg],
        columns: usize,
    ) -> Result<Vec<Vec<Cell>>> {
        #[cfg(feature = "duckdb")]
        if let Some(duck) = &self.duck {
            match Self::run_duckdb(duck, &build(Dialect::DuckDb), args, columns) {
                Ok(rows) => return Ok(rows),
                Err(e) => warn!(error = %e, "DuckDB query failed, retrying on SQLite"),
            }
        }
        self.run_sqlite(&build(Dialect::Sqlite), args, columns)
    }

    /// Totals per day for one site over `[start, end]`.
    pub fn daily_totals(
        &self,
        site_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyTotal>> {
        let rows = self.run(
            |d| {
                format!(
                    r#"
                    SELECT CAST(date AS VARCHAR),
                           CAST(SUM(clicks) AS BIGINT),
                           CAST(SUM(impressions) AS BIGINT),
                           CAST(AVG(position) AS DOUBLE)
                    FROM {}
                    WHERE site_id = ? AND date BETWEEN ? AND ?
                    GROUP BY date
                    ORDER BY date
                    "#,
                    d.table("performance_data")
                )
            },
            &[site_id.into(), start.into(), end.into()],
            4,
        )?;

        rows.iter()
            .map(|r| {
                let clicks = r[1].int()?;
                let impressions = r[2].int()?;
                Ok(DailyTotal {
                    date: r[0].date()?,
                    clicks,
                    impressions,
                    ctr: ratio(clicks, impressions),
                    avg_position: r[3].real()?,
                })
            })
            .collect()
    }

    /// Daily totals with a trailing `window`-day moving average.
    ///
    /// The window counts days that have data; missing days are not filled.
    pub fn moving_average(
        &self,
        site_id: i64,
        start: NaiveDate,
        end: NaiveDate,
        window: u32,
    ) -> Result<Vec<MovingAveragePoint>> {
        if window == 0 {
            return Err(RepositoryError::InvalidData(
                "moving average window must be at least 1".to_string(),
            ));
        }
        let preceding = window - 1;
        let rows = self.run(
            |d| {
                format!(
                    r#"
                    SELECT day, clicks, impressions,
                           CAST(AVG(clicks) OVER w AS DOUBLE),
                           CAST(AVG(impressions) OVER w AS DOUBLE)
                    FROM (
                        SELECT CAST(date AS VARCHAR) AS day,
                               CAST(SUM(clicks) AS BIGINT) AS clicks,
                               CAST(SUM(impressions) AS BIGINT) AS impressions
                        FROM {}
                        WHERE site_id = ? AND date BETWEEN ? AND ?
                        GROUP BY date
                    ) daily
                    WINDOW w AS (ORDER BY day ROWS BETWEEN {} PRECEDING AND CURRENT ROW)
                    ORDER BY day
                    "#,
                    d.table("performance_data"),
                    preceding
                )
            },
            &[site_id.into(), start.into(), end.into()],
            5,
        )?;

        rows.iter()
            .map(|r| {
                Ok(MovingAveragePoint {
                    date: r[0].date()?,
                    clicks: r[1].int()?,
                    impressions: r[2].int()?,
                    clicks_avg: r[3].real()?,
                    impressions_avg: r[4].real()?,
                })
            })
            .collect()
    }

    /// Weekly totals (weeks start Monday) with deltas against the prior week.
    pub fn week_over_week(
        &self,
        site_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<WeekOverWeek>> {
        let rows = self.run(
            |d| {
                format!(
                    r#"
                    WITH weekly AS (
                        SELECT {} AS week_start,
                               CAST(SUM(clicks) AS BIGINT) AS clicks,
                               CAST(SUM(impressions) AS BIGINT) AS impressions
                        FROM {}
                        WHERE site_id = ? AND date BETWEEN ? AND ?
                        GROUP BY 1
                    )
                    SELECT CAST(week_start AS VARCHAR), clicks, impressions,
                           LAG(clicks) OVER (ORDER BY week_start),
                           LAG(impressions) OVER (ORDER BY week_start)
                    FROM weekly
                    ORDER BY week_start
                    "#,
                    d.week_start("date"),
                    d.table("performance_data")
                )
            },
            &[site_id.into(), start.into(), end.into()],
            5,
        )?;

        rows.iter()
            .map(|r| {
                let clicks = r[1].int()?;
                let previous_clicks = r[3].opt_int()?;
                let clicks_change_pct = match previous_clicks {
                    Some(prev) if prev > 0 => Some((clicks - prev) as f64 * 100.0 / prev as f64),
                    _ => None,
                };
                Ok(WeekOverWeek {
                    week_start: r[0].date()?,
                    clicks,
                    impressions: r[2].int()?,
                    previous_clicks,
                    previous_impressions: r[4].opt_int()?,
                    clicks_change_pct,
                })
            })
            .collect()
    }

    /// Top `limit` queries by clicks.
    pub fn top_queries(
        &self,
        site_id: i64,
        start: NaiveDate,
        end: NaiveDate,
        limit: u32,
    ) -> Result<Vec<RankedItem>> {
        self.top_by("query", site_id, start, end, limit)
    }

    /// Top `limit` pages by clicks.
    pub fn top_pages(
        &self,
        site_id: i64,
        start: NaiveDate,
        end: NaiveDate,
        limit: u32,
    ) -> Result<Vec<RankedItem>> {
        self.top_by("page", site_id, start, end, limit)
    }

    fn top_by(
        &self,
        dimension: &'static str,
        site_id: i64,
        start: NaiveDate,
        end: NaiveDate,
        limit: u32,
    ) -> Result<Vec<RankedItem>> {
        let rows = self.run(
            |d| {
                format!(
                    r#"
                    SELECT item_rank, item, clicks, impressions, avg_position
                    FROM (
                        SELECT CAST(ROW_NUMBER() OVER (ORDER BY SUM(clicks) DESC, {dim} ASC) AS BIGINT) AS item_rank,
                               {dim} AS item,
                               CAST(SUM(clicks) AS BIGINT) AS clicks,
                               CAST(SUM(impressions) AS BIGINT) AS impressions,
                               CAST(AVG(position) AS DOUBLE) AS avg_position
                        FROM {table}
                        WHERE site_id = ? AND date BETWEEN ? AND ? AND {dim} <> ''
                        GROUP BY {dim}
                    ) ranked
                    WHERE item_rank <= ?
                    ORDER BY item_rank
                    "#,
                    dim = dimension,
                    table = d.table("performance_data")
                )
            },
            &[
                site_id.into(),
                start.into(),
                end.into(),
                Arg::Int(i64::from(limit)),
            ],
            5,
        )?;

        rows.iter()
            .map(|r| {
                let clicks = r[2].int()?;
                let impressions = r[3].int()?;
                Ok(RankedItem {
                    rank: r[0].int()? as u32,
                    key: r[1].text()?,
                    clicks,
                    impressions,
                    ctr: ratio(clicks, impressions),
                    avg_position: r[4].real()?,
                })
            })
            .collect()
    }

    /// Clicks and impressions by hour of day from hourly data.
    pub fn hourly_profile(
        &self,
        site_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<HourlyProfilePoint>> {
        let rows = self.run(
            |d| {
                format!(
                    r#"
                    SELECT CAST(hour AS BIGINT),
                           CAST(SUM(clicks) AS BIGINT),
                           CAST(SUM(impressions) AS BIGINT)
                    FROM {}
                    WHERE site_id = ? AND date BETWEEN ? AND ?
                    GROUP BY hour
                    ORDER BY hour
                    "#,
                    d.table("hourly_data")
                )
            },
            &[site_id.into(), start.into(), end.into()],
            3,
        )?;

        rows.iter()
            .map(|r| {
                Ok(HourlyProfilePoint {
                    hour: r[0].int()? as u8,
                    clicks: r[1].int()?,
                    impressions: r[2].int()?,
                })
            })
            .collect()
    }
}
