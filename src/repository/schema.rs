//! Row-store schema and secondary index definitions.

use rusqlite::{params, Connection};

use super::Result;

/// Storage format version recorded in `storage_meta`.
pub const FORMAT_VERSION: &str = "1";

/// Secondary indexes that bulk loads may drop and rebuild.
///
/// Natural-key uniqueness lives in table constraints and is never dropped.
pub const SECONDARY_INDEXES: &[(&str, &str)] = &[
    (
        "idx_performance_site_date",
        "CREATE INDEX IF NOT EXISTS idx_performance_site_date ON performance_data(site_id, date)",
    ),
    (
        "idx_performance_query",
        "CREATE INDEX IF NOT EXISTS idx_performance_query ON performance_data(site_id, query)",
    ),
    (
        "idx_performance_page",
        "CREATE INDEX IF NOT EXISTS idx_performance_page ON performance_data(site_id, page)",
    ),
    (
        "idx_performance_date",
        "CREATE INDEX IF NOT EXISTS idx_performance_date ON performance_data(date)",
    ),
    (
        "idx_hourly_site_date_hour",
        "CREATE INDEX IF NOT EXISTS idx_hourly_site_date_hour ON hourly_data(site_id, date, hour)",
    ),
];

/// Create tables and indexes if they do not exist.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS storage_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sites (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'uncategorized',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Daily performance, one row per natural key
        CREATE TABLE IF NOT EXISTS performance_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site_id INTEGER NOT NULL REFERENCES sites(id),
            date TEXT NOT NULL,
            page TEXT NOT NULL,
            query TEXT NOT NULL,
            device TEXT NOT NULL,
            search_type TEXT NOT NULL,
            clicks INTEGER NOT NULL DEFAULT 0,
            impressions INTEGER NOT NULL DEFAULT 0,
            ctr REAL NOT NULL DEFAULT 0,
            position REAL NOT NULL DEFAULT 0,
            UNIQUE(site_id, date, page, query, device, search_type)
        );

        -- Hourly performance for the trailing window
        CREATE TABLE IF NOT EXISTS hourly_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site_id INTEGER NOT NULL REFERENCES sites(id),
            date TEXT NOT NULL,
            hour INTEGER NOT NULL CHECK (hour BETWEEN 0 AND 23),
            query TEXT NOT NULL,
            page TEXT NOT NULL,
            position REAL NOT NULL DEFAULT 0,
            clicks INTEGER NOT NULL DEFAULT 0,
            impressions INTEGER NOT NULL DEFAULT 0,
            ctr REAL NOT NULL DEFAULT 0,
            UNIQUE(site_id, date, hour, query, page)
        );
    "#,
    )?;

    create_secondary_indexes(conn)?;

    conn.execute(
        "INSERT OR IGNORE INTO storage_meta (key, value) VALUES ('format_version', ?)",
        params![FORMAT_VERSION],
    )?;

    Ok(())
}

/// Create every secondary index that is missing.
pub fn create_secondary_indexes(conn: &Connection) -> Result<()> {
    for (_, sql) in SECONDARY_INDEXES {
        conn.execute(sql, [])?;
    }
    Ok(())
}

/// Drop every secondary index.
pub fn drop_secondary_indexes(conn: &Connection) -> Result<()> {
    for (name, _) in SECONDARY_INDEXES {
        conn.execute(&format!("DROP INDEX IF EXISTS {}", name), [])?;
    }
    Ok(())
}

/// Names of the secondary indexes currently present.
pub fn present_secondary_indexes(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}
