//! Recipient directory backed by the `users` and `user_channel_preferences` tables.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{UserChannelPreferenceDbModel, UserDbModel};

/// Read-only address lookup used by the delivery pipeline.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn channel_preference(
        &self,
        user_id: &str,
        channel_type: &str,
    ) -> Result<Option<UserChannelPreferenceDbModel>>;
    async fn primary_email(&self, user_id: &str) -> Result<Option<String>>;
}

/// SQLx implementation of RecipientDirectory.
pub struct SqlxRecipientDirectory {
    pool: SqlitePool,
}

impl SqlxRecipientDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_user(&self, user: &UserDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, display_name, created_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET email = excluded.email, display_name = excluded.display_name
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_preference(&self, pref: &UserChannelPreferenceDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_channel_preferences (user_id, channel_type, address, enabled, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, channel_type) DO UPDATE SET
                address = excluded.address,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&pref.user_id)
        .bind(&pref.channel_type)
        .bind(&pref.address)
        .bind(pref.enabled)
        .bind(pref.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecipientDirectory for SqlxRecipientDirectory {
    async fn channel_preference(
        &self,
        user_id: &str,
        channel_type: &str,
    ) -> Result<Option<UserChannelPreferenceDbModel>> {
        let row = sqlx::query_as::<_, UserChannelPreferenceDbModel>(
            "SELECT * FROM user_channel_preferences WHERE user_id = ? AND channel_type = ?",
        )
        .bind(user_id)
        .bind(channel_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn primary_email(&self, user_id: &str) -> Result<Option<String>> {
        let email: Option<Option<String>> =
            sqlx::query_scalar("SELECT email FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(email.flatten())
    }
}
