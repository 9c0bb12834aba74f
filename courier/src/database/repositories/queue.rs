//! Notification queue repository.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{QueueEntryDbModel, QueueState};
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Notification queue repository trait.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn insert(&self, entry: &QueueEntryDbModel) -> Result<()>;
    async fn get(&self, id: &str) -> Result<QueueEntryDbModel>;

    /// Atomically move up to `limit` due entries to `sending` and return them
    /// in dispatch order.
    async fn claim_due(&self, limit: i64, now: i64) -> Result<Vec<QueueEntryDbModel>>;

    // Transitions out of `sending`. Each returns whether the row moved.
    async fn mark_delivered(&self, id: &str, now: i64) -> Result<bool>;
    async fn mark_retry(
        &self,
        id: &str,
        retry_count: i64,
        next_retry_at: i64,
        error: &str,
        now: i64,
    ) -> Result<bool>;
    async fn mark_dead_letter(
        &self,
        id: &str,
        retry_count: i64,
        error: &str,
        now: i64,
    ) -> Result<bool>;

    /// Hand a claimed entry back to `queued` without touching its retry
    /// counters.
    async fn release_claim(&self, id: &str, now: i64) -> Result<bool>;

    async fn requeue_dead_letters(&self, ids: &[String], now: i64) -> Result<u64>;
    /// Return entries stranded in `sending` to `queued`.
    async fn reset_interrupted(&self, now: i64) -> Result<u64>;

    async fn count_by_state(&self) -> Result<HashMap<QueueState, i64>>;
    async fn count_pending(&self, now: i64) -> Result<i64>;
    async fn list_by_state(&self, state: QueueState, limit: i64)
    -> Result<Vec<QueueEntryDbModel>>;
    async fn cleanup_delivered(&self, cutoff: i64) -> Result<u64>;
}

/// SQLx implementation of QueueRepository.
pub struct SqlxQueueRepository {
    pool: SqlitePool,
}

impl SqlxQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueRepository for SqlxQueueRepository {
    async fn insert(&self, entry: &QueueEntryDbModel) -> Result<()> {
        retry_on_sqlite_busy("insert_queue_entry", || async {
            sqlx::query(
                r#"
                INSERT INTO notification_queue (
                    id, user_id, channel_type, template_id, priority, state,
                    subject, body, variables, retry_count, max_retries,
                    next_retry_at, delivered_at, failed_at, error_message,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.id)
            .bind(&entry.user_id)
            .bind(&entry.channel_type)
            .bind(&entry.template_id)
            .bind(entry.priority)
            .bind(&entry.state)
            .bind(&entry.subject)
            .bind(&entry.body)
            .bind(&entry.variables)
            .bind(entry.retry_count)
            .bind(entry.max_retries)
            .bind(entry.next_retry_at)
            .bind(entry.delivered_at)
            .bind(entry.failed_at)
            .bind(&entry.error_message)
            .bind(entry.created_at)
            .bind(entry.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<QueueEntryDbModel> {
        sqlx::query_as::<_, QueueEntryDbModel>("SELECT * FROM notification_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("QueueEntry", id))
    }

    async fn claim_due(&self, limit: i64, now: i64) -> Result<Vec<QueueEntryDbModel>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let mut claimed = retry_on_sqlite_busy("claim_queue_entries", || async {
            // The outer state predicate keeps a concurrent claimer from
            // re-claiming rows that moved between subquery and update.
            let rows = sqlx::query_as::<_, QueueEntryDbModel>(
                r#"
                UPDATE notification_queue
                SET state = 'sending', updated_at = ?
                WHERE id IN (
                    SELECT id FROM notification_queue
                    WHERE state IN ('created', 'queued', 'failed')
                      AND (next_retry_at IS NULL OR next_retry_at <= ?)
                    ORDER BY priority DESC, created_at ASC, rowid ASC
                    LIMIT ?
                )
                AND state IN ('created', 'queued', 'failed')
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        })
        .await?;

        // RETURNING order is unspecified; the sort is stable so rows tied on
        // both keys keep their returned order.
        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: &str, now: i64) -> Result<bool> {
        retry_on_sqlite_busy("mark_entry_delivered", || async {
            let result = sqlx::query(
                r#"
                UPDATE notification_queue SET
                    state = 'delivered',
                    delivered_at = ?,
                    next_retry_at = NULL,
                    error_message = NULL,
                    updated_at = ?
                WHERE id = ? AND state = 'sending'
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn mark_retry(
        &self,
        id: &str,
        retry_count: i64,
        next_retry_at: i64,
        error: &str,
        now: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("mark_entry_retry", || async {
            let result = sqlx::query(
                r#"
                UPDATE notification_queue SET
                    state = 'failed',
                    retry_count = ?,
                    next_retry_at = ?,
                    error_message = ?,
                    updated_at = ?
                WHERE id = ? AND state = 'sending'
                "#,
            )
            .bind(retry_count)
            .bind(next_retry_at)
            .bind(error)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn mark_dead_letter(
        &self,
        id: &str,
        retry_count: i64,
        error: &str,
        now: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("mark_entry_dead_letter", || async {
            let result = sqlx::query(
                r#"
                UPDATE notification_queue SET
                    state = 'dead_letter',
                    retry_count = ?,
                    next_retry_at = NULL,
                    failed_at = ?,
                    error_message = ?,
                    updated_at = ?
                WHERE id = ? AND state = 'sending'
                "#,
            )
            .bind(retry_count)
            .bind(now)
            .bind(error)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn release_claim(&self, id: &str, now: i64) -> Result<bool> {
        retry_on_sqlite_busy("release_entry_claim", || async {
            let result = sqlx::query(
                "UPDATE notification_queue SET state = 'queued', updated_at = ? WHERE id = ? AND state = 'sending'",
            )
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn requeue_dead_letters(&self, ids: &[String], now: i64) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE notification_queue SET
                state = 'queued',
                retry_count = 0,
                next_retry_at = NULL,
                error_message = NULL,
                failed_at = NULL,
                updated_at = ?
            WHERE state = 'dead_letter' AND id IN ({placeholders})
            "#
        );

        retry_on_sqlite_busy("requeue_dead_letters", || async {
            let mut query = sqlx::query(&sql).bind(now);
            for id in ids {
                query = query.bind(id);
            }
            let result = query.execute(&self.pool).await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn reset_interrupted(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE notification_queue SET state = 'queued', updated_at = ? WHERE state = 'sending'",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_state(&self) -> Result<HashMap<QueueState, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM notification_queue GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts: HashMap<QueueState, i64> =
            QueueState::ALL.iter().map(|state| (*state, 0)).collect();
        for (state, count) in rows {
            match QueueState::parse(&state) {
                Some(state) => {
                    counts.insert(state, count);
                }
                None => tracing::warn!(state = %state, "Unknown queue state in notification_queue"),
            }
        }
        Ok(counts)
    }

    async fn count_pending(&self, now: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM notification_queue
            WHERE state IN ('created', 'queued', 'failed')
              AND (next_retry_at IS NULL OR next_retry_at <= ?)
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_by_state(
        &self,
        state: QueueState,
        limit: i64,
    ) -> Result<Vec<QueueEntryDbModel>> {
        let rows = sqlx::query_as::<_, QueueEntryDbModel>(
            "SELECT * FROM notification_queue WHERE state = ? ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn cleanup_delivered(&self, cutoff: i64) -> Result<u64> {
        retry_on_sqlite_busy("cleanup_delivered_entries", || async {
            let result = sqlx::query(
                "DELETE FROM notification_queue WHERE state = 'delivered' AND delivered_at < ?",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;

    async fn setup() -> SqlxQueueRepository {
        let pool = init_memory_pool().await.unwrap();
        SqlxQueueRepository::new(pool)
    }

    fn entry(priority: i64, created_at: i64) -> QueueEntryDbModel {
        let mut entry = QueueEntryDbModel::new("webhook", "subject", "body", priority, 3);
        entry.created_at = created_at;
        entry.updated_at = created_at;
        entry
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() {
        let repo = setup().await;
        let old_low = entry(1, 1_000);
        let new_high = entry(10, 3_000);
        let old_high = entry(10, 2_000);
        for e in [&old_low, &new_high, &old_high] {
            repo.insert(e).await.unwrap();
        }

        let claimed = repo.claim_due(10, 10_000).await.unwrap();
        let ids: Vec<&str> = claimed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![old_high.id.as_str(), new_high.id.as_str(), old_low.id.as_str()]);
        assert!(claimed.iter().all(|e| e.state == "sending"));

        // Already sending, nothing left to claim.
        assert!(repo.claim_due(10, 10_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_skips_future_retries() {
        let repo = setup().await;
        let mut waiting = entry(5, 1_000);
        waiting.state = "failed".to_string();
        waiting.retry_count = 1;
        waiting.next_retry_at = Some(50_000);
        repo.insert(&waiting).await.unwrap();

        assert!(repo.claim_due(10, 10_000).await.unwrap().is_empty());
        assert_eq!(repo.count_pending(10_000).await.unwrap(), 0);

        let claimed = repo.claim_due(10, 50_000).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_claim_limit_zero_is_noop() {
        let repo = setup().await;
        repo.insert(&entry(1, 1_000)).await.unwrap();
        assert!(repo.claim_due(0, 10_000).await.unwrap().is_empty());
        assert_eq!(repo.count_pending(10_000).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transitions_require_sending() {
        let repo = setup().await;
        let e = entry(1, 1_000);
        repo.insert(&e).await.unwrap();

        assert!(!repo.mark_delivered(&e.id, 2_000).await.unwrap());
        assert!(!repo.mark_retry(&e.id, 1, 5_000, "boom", 2_000).await.unwrap());
        assert!(!repo.mark_dead_letter(&e.id, 3, "boom", 2_000).await.unwrap());

        repo.claim_due(1, 2_000).await.unwrap();
        assert!(repo.mark_delivered(&e.id, 2_500).await.unwrap());
        let stored = repo.get(&e.id).await.unwrap();
        assert_eq!(stored.state, "delivered");
        assert_eq!(stored.delivered_at, Some(2_500));

        // Terminal rows do not move again.
        assert!(!repo.mark_dead_letter(&e.id, 3, "late", 3_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_interrupted_keeps_counters() {
        let repo = setup().await;
        let mut e = entry(1, 1_000);
        e.retry_count = 2;
        repo.insert(&e).await.unwrap();
        repo.claim_due(1, 2_000).await.unwrap();

        assert_eq!(repo.reset_interrupted(3_000).await.unwrap(), 1);
        let stored = repo.get(&e.id).await.unwrap();
        assert_eq!(stored.state, "queued");
        assert_eq!(stored.retry_count, 2);
    }

    #[tokio::test]
    async fn test_release_claim_restores_queued() {
        let repo = setup().await;
        let mut e = entry(1, 1_000);
        e.state = "failed".to_string();
        e.retry_count = 1;
        e.next_retry_at = Some(1_500);
        repo.insert(&e).await.unwrap();

        assert!(!repo.release_claim(&e.id, 2_000).await.unwrap());
        repo.claim_due(1, 2_000).await.unwrap();
        assert!(repo.release_claim(&e.id, 2_500).await.unwrap());

        let stored = repo.get(&e.id).await.unwrap();
        assert_eq!(stored.state, "queued");
        assert_eq!(stored.retry_count, 1);
        assert_eq!(repo.claim_due(1, 3_000).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_empty_ids() {
        let repo = setup().await;
        assert_eq!(repo.requeue_dead_letters(&[], 1_000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_count_by_state_includes_zeroes() {
        let repo = setup().await;
        repo.insert(&entry(1, 1_000)).await.unwrap();
        let counts = repo.count_by_state().await.unwrap();
        assert_eq!(counts.len(), QueueState::ALL.len());
        assert_eq!(counts[&QueueState::Created], 1);
        assert_eq!(counts[&QueueState::DeadLetter], 0);
    }
}
