//! Site models for tracked properties.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category assigned to sites created implicitly by a sync request.
pub const DEFAULT_CATEGORY: &str = "uncategorized";

/// A tracked site (one property in the external reporting API).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    /// Surrogate key.
    pub id: i64,
    /// Normalised domain, unique across all sites.
    pub domain: String,
    /// Human-readable name.
    pub display_name: String,
    /// Free-form grouping label.
    pub category: String,
    /// Inactive sites are skipped by jobs that request active sites only.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalise a domain or site URL into the business key stored on [`Site`].
///
/// Accepts `example.com`, `https://Example.com/`, and `sc-domain:example.com`
/// and maps them all to `example.com`.
pub fn normalize_domain(input: &str) -> String {
    let trimmed = input.trim();
    let without_prefix = trimmed
        .strip_prefix("sc-domain:")
        .or_else(|| trimmed.strip_prefix("https://"))
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let host = without_prefix.split('/').next().unwrap_or(without_prefix);
    host.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("example.com"), "example.com");
        assert_eq!(normalize_domain("https://Example.com/"), "example.com");
        assert_eq!(normalize_domain("http://example.com/blog/"), "example.com");
        assert_eq!(normalize_domain("sc-domain:Example.COM"), "example.com");
        assert_eq!(normalize_domain("  example.com.  "), "example.com");
    }
}
