//! In-memory usage store. Counts are lost when the process exits.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;

use super::backend::{RateLimitResult, UsageStore};

#[derive(Debug, Default)]
pub struct InMemoryUsageStore {
    counts: Mutex<HashMap<NaiveDate, u64>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn load(&self, date: NaiveDate) -> RateLimitResult<u64> {
        Ok(self.counts.lock().await.get(&date).copied().unwrap_or(0))
    }

    async fn increment(&self, date: NaiveDate) -> RateLimitResult<u64> {
        let mut counts = self.counts.lock().await;
        let count = counts.entry(date).or_insert(0);
        *count += 1;
        Ok(*count)
    }
}
