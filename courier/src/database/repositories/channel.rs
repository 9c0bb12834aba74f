//! Channel state repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::ChannelStateDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Channel state repository trait.
#[async_trait]
pub trait ChannelStateRepository: Send + Sync {
    /// Insert the row unless one already exists for its channel type.
    /// Returns `true` when a row was created.
    async fn insert_if_missing(&self, row: &ChannelStateDbModel) -> Result<bool>;
    async fn get_state(&self, channel_type: &str) -> Result<ChannelStateDbModel>;
    async fn list_states(&self) -> Result<Vec<ChannelStateDbModel>>;
    async fn set_enabled(&self, channel_type: &str, enabled: bool) -> Result<()>;
    async fn update_config(&self, channel_type: &str, config: &str) -> Result<()>;

    // Connectivity tests
    async fn mark_testing(&self, channel_type: &str) -> Result<()>;
    async fn record_test_success(&self, channel_type: &str) -> Result<()>;
    async fn record_test_failure(&self, channel_type: &str, error: &str) -> Result<()>;

    // Delivery outcomes. `None` means no row exists for the type.
    async fn record_success(&self, channel_type: &str) -> Result<Option<ChannelStateDbModel>>;
    async fn record_failure(
        &self,
        channel_type: &str,
        error: &str,
        failure_threshold: i64,
    ) -> Result<Option<ChannelStateDbModel>>;
}

/// SQLx implementation of ChannelStateRepository.
pub struct SqlxChannelStateRepository {
    pool: SqlitePool,
}

impl SqlxChannelStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn ensure_updated(rows_affected: u64, channel_type: &str) -> Result<()> {
        if rows_affected == 0 {
            return Err(Error::not_found("ChannelState", channel_type));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelStateRepository for SqlxChannelStateRepository {
    async fn insert_if_missing(&self, row: &ChannelStateDbModel) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_channel_state (
                channel_type, display_name, enabled, state, config,
                last_test_at, last_success_at, last_error, failure_count,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(channel_type) DO NOTHING
            "#,
        )
        .bind(&row.channel_type)
        .bind(&row.display_name)
        .bind(row.enabled)
        .bind(&row.state)
        .bind(&row.config)
        .bind(row.last_test_at)
        .bind(row.last_success_at)
        .bind(&row.last_error)
        .bind(row.failure_count)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_state(&self, channel_type: &str) -> Result<ChannelStateDbModel> {
        sqlx::query_as::<_, ChannelStateDbModel>(
            "SELECT * FROM notification_channel_state WHERE channel_type = ?",
        )
        .bind(channel_type)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("ChannelState", channel_type))
    }

    async fn list_states(&self) -> Result<Vec<ChannelStateDbModel>> {
        let rows = sqlx::query_as::<_, ChannelStateDbModel>(
            "SELECT * FROM notification_channel_state ORDER BY channel_type",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_enabled(&self, channel_type: &str, enabled: bool) -> Result<()> {
        let state = if enabled { "enabled" } else { "disabled" };
        let result = sqlx::query(
            "UPDATE notification_channel_state SET enabled = ?, state = ?, updated_at = ? WHERE channel_type = ?",
        )
        .bind(enabled)
        .bind(state)
        .bind(now_ms())
        .bind(channel_type)
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(result.rows_affected(), channel_type)
    }

    async fn update_config(&self, channel_type: &str, config: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE notification_channel_state SET config = ?, updated_at = ? WHERE channel_type = ?",
        )
        .bind(config)
        .bind(now_ms())
        .bind(channel_type)
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(result.rows_affected(), channel_type)
    }

    async fn mark_testing(&self, channel_type: &str) -> Result<()> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE notification_channel_state SET state = 'testing', last_test_at = ?, updated_at = ? WHERE channel_type = ?",
        )
        .bind(now)
        .bind(now)
        .bind(channel_type)
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(result.rows_affected(), channel_type)
    }

    async fn record_test_success(&self, channel_type: &str) -> Result<()> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE notification_channel_state SET
                state = 'enabled',
                enabled = 1,
                failure_count = 0,
                last_success_at = ?,
                last_error = NULL,
                updated_at = ?
            WHERE channel_type = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(channel_type)
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(result.rows_affected(), channel_type)
    }

    async fn record_test_failure(&self, channel_type: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE notification_channel_state SET
                state = 'failed',
                last_error = ?,
                failure_count = failure_count + 1,
                updated_at = ?
            WHERE channel_type = ?
            "#,
        )
        .bind(error)
        .bind(now_ms())
        .bind(channel_type)
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(result.rows_affected(), channel_type)
    }

    async fn record_success(&self, channel_type: &str) -> Result<Option<ChannelStateDbModel>> {
        retry_on_sqlite_busy("record_channel_success", || async {
            let now = now_ms();
            let row = sqlx::query_as::<_, ChannelStateDbModel>(
                r#"
                UPDATE notification_channel_state SET
                    last_success_at = ?,
                    failure_count = 0,
                    state = CASE
                        WHEN state = 'failed' AND enabled = 1 THEN 'enabled'
                        WHEN state = 'failed' THEN 'disabled'
                        ELSE state
                    END,
                    updated_at = ?
                WHERE channel_type = ?
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(channel_type)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    async fn record_failure(
        &self,
        channel_type: &str,
        error: &str,
        failure_threshold: i64,
    ) -> Result<Option<ChannelStateDbModel>> {
        retry_on_sqlite_busy("record_channel_failure", || async {
            // SET expressions see the pre-update row, hence `failure_count + 1`.
            let row = sqlx::query_as::<_, ChannelStateDbModel>(
                r#"
                UPDATE notification_channel_state SET
                    last_error = ?,
                    failure_count = failure_count + 1,
                    state = CASE WHEN failure_count + 1 >= ? THEN 'failed' ELSE state END,
                    updated_at = ?
                WHERE channel_type = ?
                RETURNING *
                "#,
            )
            .bind(error)
            .bind(failure_threshold)
            .bind(now_ms())
            .bind(channel_type)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }
}
