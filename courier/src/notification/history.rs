//! Append-only delivery history with pagination and retention.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::Result;
use crate::database::models::{HistoryRecordDbModel, HistoryStatus};
use crate::database::repositories::{HistoryFilter, HistoryRepository};
use crate::database::time::retention_cutoff_ms;

/// Largest page size served by [`HistoryLog::list`].
pub const MAX_PER_PAGE: u32 = 200;

/// History listing parameters.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    /// 1-based page number; 0 is treated as 1.
    pub page: u32,
    /// Clamped to `1..=MAX_PER_PAGE`.
    pub per_page: u32,
    pub channel_type: Option<String>,
    pub status: Option<HistoryStatus>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 50,
            channel_type: None,
            status: None,
        }
    }
}

impl HistoryQuery {
    fn page(&self) -> u32 {
        self.page.max(1)
    }

    fn per_page(&self) -> u32 {
        self.per_page.clamp(1, MAX_PER_PAGE)
    }
}

/// One page of history, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecordDbModel>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

/// Delivery history service.
pub struct HistoryLog {
    repo: Arc<dyn HistoryRepository>,
}

impl HistoryLog {
    pub fn new(repo: Arc<dyn HistoryRepository>) -> Self {
        Self { repo }
    }

    pub async fn record(&self, record: &HistoryRecordDbModel) -> Result<()> {
        self.repo.append(record).await
    }

    pub async fn list(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let page = query.page();
        let per_page = query.per_page();
        let filter = HistoryFilter {
            channel_type: query.channel_type.clone(),
            status: query.status,
        };

        let offset = i64::from(page - 1) * i64::from(per_page);
        let records = self
            .repo
            .list(&filter, i64::from(per_page), offset)
            .await?;
        let total = self.repo.count(&filter).await?;

        Ok(HistoryPage {
            records,
            total,
            page,
            per_page,
        })
    }

    pub async fn for_entry(&self, queue_entry_id: &str) -> Result<Vec<HistoryRecordDbModel>> {
        self.repo.list_for_entry(queue_entry_id).await
    }

    /// Delete records older than `retention_days`.
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let deleted = self
            .repo
            .cleanup_older_than(retention_cutoff_ms(retention_days))
            .await?;
        if deleted > 0 {
            info!(deleted, retention_days, "Cleaned up old delivery history");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_clamps() {
        let query = HistoryQuery {
            page: 0,
            per_page: 10_000,
            ..Default::default()
        };
        assert_eq!(query.page(), 1);
        assert_eq!(query.per_page(), MAX_PER_PAGE);

        let query = HistoryQuery {
            per_page: 0,
            ..Default::default()
        };
        assert_eq!(query.per_page(), 1);
    }
}
