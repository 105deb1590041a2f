//! Bulk-load mode: drop secondary indexes and relax durability for large
//! backfills, then restore both.
//!
//! Entering and leaving go through [`BulkLoadGuard`]. Calling
//! [`BulkLoadGuard::finish`] restores the normal state and reports errors;
//! dropping the guard without calling it still restores, logging any failure.

use std::sync::atomic::Ordering;

use rusqlite::Connection;
use tracing::{info, warn};

use super::{schema, RepositoryError, Result, StorageEngine};

fn enter(conn: &Connection) -> Result<()> {
    schema::drop_secondary_indexes(conn)?;
    conn.execute_batch(
        r#"
        PRAGMA synchronous = OFF;
        PRAGMA cache_size = -262144;
        PRAGMA temp_store = MEMORY;
    "#,
    )?;
    Ok(())
}

fn leave(conn: &Connection) -> Result<()> {
    schema::create_secondary_indexes(conn)?;
    conn.execute_batch(
        r#"
        ANALYZE;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -2000;
        PRAGMA temp_store = DEFAULT;
    "#,
    )?;
    Ok(())
}

/// Active bulk-load session on a [`StorageEngine`].
#[must_use = "dropping the guard immediately ends bulk-load mode"]
pub struct BulkLoadGuard<'a> {
    engine: &'a StorageEngine,
    finished: bool,
}

impl<'a> BulkLoadGuard<'a> {
    /// Leave bulk-load mode, rebuilding indexes and restoring pragmas.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.engine.end_bulk_load()
    }
}

impl Drop for BulkLoadGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.engine.end_bulk_load() {
            warn!(error = %e, "Failed to leave bulk-load mode");
        }
    }
}

impl StorageEngine {
    /// Enter bulk-load mode.
    ///
    /// Fails if bulk-load mode is already active.
    pub fn bulk_load(&self) -> Result<BulkLoadGuard<'_>> {
        if self
            .bulk_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RepositoryError::InvalidData(
                "bulk-load mode already active".to_string(),
            ));
        }

        if let Err(e) = self.with_writer(|conn| enter(conn)) {
            // Put back whatever was partially dropped
            if let Err(restore) = self.with_writer(|conn| leave(conn)) {
                warn!(error = %restore, "Failed to restore after aborted bulk-load entry");
            }
            self.bulk_active.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!("Entered bulk-load mode");
        Ok(BulkLoadGuard {
            engine: self,
            finished: false,
        })
    }

    fn end_bulk_load(&self) -> Result<()> {
        let result = self.with_writer(|conn| leave(conn));
        self.bulk_active.store(false, Ordering::SeqCst);
        if result.is_ok() {
            info!("Left bulk-load mode");
        }
        result
    }
}
