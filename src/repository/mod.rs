//! Storage engine: SQLite row store for writes, analytical engine for reads.
//!
//! All persisted rows are owned by [`StorageEngine`]. Writes go through a
//! single long-lived writer connection guarded by a mutex; each logical write
//! (insert batch, delete-then-insert replace, bulk-load toggle) takes that
//! lock exactly once and runs inside one transaction. Readers open their own
//! connections and rely on WAL mode to proceed while the writer works.

pub mod analytics;
pub mod bulk;
mod insert;
pub mod schema;
mod sites;
mod stats;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

pub use analytics::{
    AnalyticsBackend, AnalyticsEngine, AnalyticsOptions, DailyTotal, HourlyProfilePoint,
    MovingAveragePoint, RankedItem, WeekOverWeek,
};
pub use bulk::BulkLoadGuard;
pub use insert::Insertable;
pub use stats::StorageStats;
pub use writer::{BufferedWriter, WriterConfig, WriterState};

/// Errors from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[cfg(feature = "duckdb")]
    #[error("Analytics engine error: {0}")]
    Analytics(#[from] duckdb::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Write lock poisoned; storage state can no longer be trusted")]
    LockPoisoned,
    #[error("Site not found: {0}")]
    SiteNotFound(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Buffered writer is closed")]
    WriterClosed,
    #[error("Storage task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Open a row-store connection with the standard pragmas.
pub(crate) fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
    "#,
    )?;
    Ok(conn)
}

/// Convert a `QueryReturnedNoRows` result into `None`.
pub(crate) fn to_option<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse a `YYYY-MM-DD` date string from the database.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| RepositoryError::InvalidData(format!("bad date '{}': {}", s, e)))
}

/// Options applied when opening a [`StorageEngine`].
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    pub analytics: AnalyticsOptions,
}

/// Durable row store plus the read-side analytical engine over the same file.
pub struct StorageEngine {
    db_path: PathBuf,
    writer: Mutex<Connection>,
    bulk_active: AtomicBool,
    analytics: AnalyticsEngine,
}

impl StorageEngine {
    /// Open (creating if needed) the store at `db_path` with default options.
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with(db_path, StorageOptions::default())
    }

    /// Open the store with explicit options.
    ///
    /// Any failure here is fatal for callers: nothing written afterwards
    /// could be trusted.
    pub fn open_with(db_path: &Path, options: StorageOptions) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = connect(db_path)?;
        schema::init_schema(&conn)?;
        info!(path = %db_path.display(), "Opened row store");

        let analytics = AnalyticsEngine::attach(db_path, &options.analytics);
        debug!(backend = ?analytics.backend(), "Analytics engine ready");

        Ok(Self {
            db_path: db_path.to_path_buf(),
            writer: Mutex::new(conn),
            bulk_active: AtomicBool::new(false),
            analytics,
        })
    }

    /// Path of the row-store file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Read-side query engine.
    pub fn analytics(&self) -> &AnalyticsEngine {
        &self.analytics
    }

    /// Whether bulk-load mode is currently active.
    pub fn is_bulk_loading(&self) -> bool {
        self.bulk_active.load(Ordering::SeqCst)
    }

    /// Run `f` holding the write lock. Callers must do all sub-steps of one
    /// logical write inside a single call; `f` must not call back into
    /// another locking method.
    pub(crate) fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| RepositoryError::LockPoisoned)?;
        f(&mut guard)
    }

    /// Open an independent read connection.
    pub(crate) fn reader(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    /// Names of the secondary indexes currently present.
    pub fn secondary_indexes(&self) -> Result<Vec<String>> {
        let conn = self.reader()?;
        schema::present_secondary_indexes(&conn)
    }

    /// Run blocking storage work on the blocking pool.
    ///
    /// Writes hold the writer lock for the whole statement batch, so async
    /// callers hand them off instead of stalling a runtime worker.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(Arc<StorageEngine>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(engine))
            .await
            .map_err(|e| RepositoryError::Task(e.to_string()))?
    }

    /// Current value of a pragma on the writer connection.
    ///
    /// Only bare pragma names are accepted.
    pub fn writer_pragma(&self, name: &str) -> Result<i64> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(RepositoryError::InvalidData(format!(
                "invalid pragma name: {}",
                name
            )));
        }
        self.with_writer(|conn| {
            let value: i64 = conn.query_row(&format!("PRAGMA {}", name), [], |row| row.get(0))?;
            Ok(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_schema_and_parent_dirs() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("stats.db");

        let engine = StorageEngine::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(engine.path(), db_path.as_path());
        assert!(!engine.is_bulk_loading());
        assert_eq!(
            engine.secondary_indexes().unwrap().len(),
            schema::SECONDARY_INDEXES.len()
        );
    }

    #[test]
    fn test_writer_pragma_rejects_non_identifiers() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(&dir.path().join("stats.db")).unwrap();
        assert_eq!(engine.writer_pragma("foreign_keys").unwrap(), 1);
        assert!(matches!(
            engine.writer_pragma("synchronous = OFF"),
            Err(RepositoryError::InvalidData(_))
        ));
        assert!(matches!(
            engine.writer_pragma(""),
            Err(RepositoryError::InvalidData(_))
        ));
        assert_eq!(engine.writer_pragma("synchronous").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_blocking_returns_result_and_maps_panics() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(StorageEngine::open(&dir.path().join("stats.db")).unwrap());

        let site = engine
            .run_blocking(|engine| engine.ensure_site("example.com"))
            .await
            .unwrap();
        assert_eq!(site.domain, "example.com");

        let crashed: Result<()> = engine
            .run_blocking(|_| -> Result<()> { panic!("writer crashed") })
            .await;
        assert!(matches!(crashed, Err(RepositoryError::Task(_))));
        // the store stays usable
        assert!(engine.site_by_domain("example.com").unwrap().is_some());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(
            parse_date("2024-01-05").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()
        );
        assert!(parse_date("05/01/2024").is_err());
        assert_eq!(parse_datetime("garbage"), DateTime::UNIX_EPOCH);
    }
}
