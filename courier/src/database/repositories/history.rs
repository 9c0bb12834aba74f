//! Delivery history repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{HistoryRecordDbModel, HistoryStatus};
use crate::database::retry::retry_on_sqlite_busy;
use crate::Result;

/// Optional filters for history listing.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub channel_type: Option<String>,
    pub status: Option<HistoryStatus>,
}

impl HistoryFilter {
    fn where_clause(&self) -> String {
        let mut conditions = Vec::new();
        if self.channel_type.is_some() {
            conditions.push("channel_type = ?");
        }
        if self.status.is_some() {
            conditions.push("status = ?");
        }
        if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        }
    }
}

/// History repository trait.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn append(&self, record: &HistoryRecordDbModel) -> Result<()>;
    /// Newest first.
    async fn list(
        &self,
        filter: &HistoryFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HistoryRecordDbModel>>;
    async fn count(&self, filter: &HistoryFilter) -> Result<i64>;
    /// All attempts for one queue entry, oldest first.
    async fn list_for_entry(&self, queue_entry_id: &str) -> Result<Vec<HistoryRecordDbModel>>;
    async fn cleanup_older_than(&self, cutoff: i64) -> Result<u64>;
}

/// SQLx implementation of HistoryRepository.
pub struct SqlxHistoryRepository {
    pool: SqlitePool,
}

impl SqlxHistoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryRepository for SqlxHistoryRepository {
    async fn append(&self, record: &HistoryRecordDbModel) -> Result<()> {
        retry_on_sqlite_busy("append_history", || async {
            sqlx::query(
                r#"
                INSERT INTO notification_history (
                    id, queue_entry_id, user_id, channel_type, status,
                    subject, body, error_message, metadata, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(&record.queue_entry_id)
            .bind(&record.user_id)
            .bind(&record.channel_type)
            .bind(&record.status)
            .bind(&record.subject)
            .bind(&record.body)
            .bind(&record.error_message)
            .bind(&record.metadata)
            .bind(record.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list(
        &self,
        filter: &HistoryFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HistoryRecordDbModel>> {
        let sql = format!(
            "SELECT * FROM notification_history {} ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
            filter.where_clause()
        );

        let mut query = sqlx::query_as::<_, HistoryRecordDbModel>(&sql);
        if let Some(channel_type) = &filter.channel_type {
            query = query.bind(channel_type);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }

        let rows = query
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn count(&self, filter: &HistoryFilter) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM notification_history {}",
            filter.where_clause()
        );

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        if let Some(channel_type) = &filter.channel_type {
            query = query.bind(channel_type);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }

        Ok(query.fetch_one(&self.pool).await?)
    }

    async fn list_for_entry(&self, queue_entry_id: &str) -> Result<Vec<HistoryRecordDbModel>> {
        let rows = sqlx::query_as::<_, HistoryRecordDbModel>(
            "SELECT * FROM notification_history WHERE queue_entry_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(queue_entry_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn cleanup_older_than(&self, cutoff: i64) -> Result<u64> {
        retry_on_sqlite_busy("cleanup_history", || async {
            let result = sqlx::query("DELETE FROM notification_history WHERE created_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
