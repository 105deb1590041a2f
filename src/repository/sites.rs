//! Site registry.

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use super::{parse_datetime, to_option, RepositoryError, Result, StorageEngine};
use crate::models::{normalize_domain, Site, DEFAULT_CATEGORY};

fn row_to_site(row: &Row<'_>) -> rusqlite::Result<Site> {
    Ok(Site {
        id: row.get("id")?,
        domain: row.get("domain")?,
        display_name: row.get("display_name")?,
        category: row.get("category")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
    })
}

fn find_by_domain(conn: &Connection, domain: &str) -> Result<Option<Site>> {
    let mut stmt = conn.prepare("SELECT * FROM sites WHERE domain = ?")?;
    to_option(stmt.query_row(params![domain], row_to_site))
}

impl StorageEngine {
    /// Return the site for `domain`, creating it if it does not exist.
    ///
    /// The domain is normalised first, so `https://example.com/` and
    /// `sc-domain:example.com` resolve to the same site.
    pub fn ensure_site(&self, domain: &str) -> Result<Site> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Err(RepositoryError::InvalidData("empty domain".to_string()));
        }

        self.with_writer(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                r#"
                INSERT OR IGNORE INTO sites (domain, display_name, category, is_active, created_at, updated_at)
                VALUES (?1, ?1, ?2, 1, ?3, ?3)
                "#,
                params![domain, DEFAULT_CATEGORY, now],
            )?;
            find_by_domain(conn, &domain)?
                .ok_or_else(|| RepositoryError::SiteNotFound(domain.clone()))
        })
    }

    /// Get a site by id.
    pub fn get_site(&self, id: i64) -> Result<Option<Site>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT * FROM sites WHERE id = ?")?;
        to_option(stmt.query_row(params![id], row_to_site))
    }

    /// Get a site by domain (normalised before lookup).
    pub fn site_by_domain(&self, domain: &str) -> Result<Option<Site>> {
        let conn = self.reader()?;
        find_by_domain(&conn, &normalize_domain(domain))
    }

    /// List sites ordered by id.
    pub fn list_sites(&self, active_only: bool) -> Result<Vec<Site>> {
        let conn = self.reader()?;
        let sql = if active_only {
            "SELECT * FROM sites WHERE is_active = 1 ORDER BY id"
        } else {
            "SELECT * FROM sites ORDER BY id"
        };
        let mut stmt = conn.prepare(sql)?;
        let sites = stmt
            .query_map([], row_to_site)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sites)
    }

    /// Activate or deactivate a site.
    pub fn set_site_active(&self, id: i64, active: bool) -> Result<()> {
        self.with_writer(|conn| {
            let changed = conn.execute(
                "UPDATE sites SET is_active = ?, updated_at = ? WHERE id = ?",
                params![active as i64, Utc::now().to_rfc3339(), id],
            )?;
            if changed == 0 {
                return Err(RepositoryError::SiteNotFound(id.to_string()));
            }
            Ok(())
        })
    }

    /// Update a site's display name and category.
    pub fn update_site_details(&self, id: i64, display_name: &str, category: &str) -> Result<Site> {
        self.with_writer(|conn| {
            let changed = conn.execute(
                "UPDATE sites SET display_name = ?, category = ?, updated_at = ? WHERE id = ?",
                params![display_name, category, Utc::now().to_rfc3339(), id],
            )?;
            if changed == 0 {
                return Err(RepositoryError::SiteNotFound(id.to_string()));
            }
            let mut stmt = conn.prepare("SELECT * FROM sites WHERE id = ?")?;
            to_option(stmt.query_row(params![id], row_to_site))?
                .ok_or_else(|| RepositoryError::SiteNotFound(id.to_string()))
        })
    }
}
