//! Insert policy and per-write accounting.

use std::fmt;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// How a write treats rows whose natural key already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertMode {
    /// Existing rows win; new duplicates are counted as skipped.
    #[default]
    Skip,
    /// Incoming rows replace existing ones. Callers pair this with a prior
    /// deletion of the target partition.
    Overwrite,
}

impl InsertMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Overwrite => "overwrite",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Some(Self::Skip),
            "overwrite" => Some(Self::Overwrite),
            _ => None,
        }
    }
}

impl fmt::Display for InsertMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row accounting for one or more insert operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertStats {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl InsertStats {
    /// Total rows accounted for.
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.skipped + self.failed
    }

    /// Rows that ended up written (new or replaced).
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl AddAssign for InsertStats {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
        self.skipped += rhs.skipped;
        self.failed += rhs.failed;
    }
}

impl fmt::Display for InsertStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserted={} updated={} skipped={} failed={}",
            self.inserted, self.updated, self.skipped, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_mode_parsing() {
        assert_eq!(InsertMode::from_str("skip"), Some(InsertMode::Skip));
        assert_eq!(InsertMode::from_str("OVERWRITE"), Some(InsertMode::Overwrite));
        assert_eq!(InsertMode::from_str("replace"), None);
        assert_eq!(InsertMode::default(), InsertMode::Skip);
    }

    #[test]
    fn test_stats_accumulate() {
        let mut total = InsertStats::default();
        total += InsertStats {
            inserted: 3,
            skipped: 1,
            ..Default::default()
        };
        total += InsertStats {
            updated: 2,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(total.total(), 7);
        assert_eq!(total.written(), 5);
        assert_eq!(total.to_string(), "inserted=3 updated=2 skipped=1 failed=1");
    }
}
