//! User and per-channel recipient preference models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Minimal user record used for address lookup.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserDbModel {
    pub id: String,
    /// Primary email address
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub created_at: i64,
}

impl UserDbModel {
    pub fn new(id: impl Into<String>, email: Option<String>) -> Self {
        Self {
            id: id.into(),
            email,
            display_name: None,
            created_at: now_ms(),
        }
    }
}

/// A user's address on one channel type.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserChannelPreferenceDbModel {
    pub user_id: String,
    pub channel_type: String,
    /// Channel-specific address (email, chat id, webhook URL, phone number)
    pub address: String,
    pub enabled: bool,
    pub updated_at: i64,
}

impl UserChannelPreferenceDbModel {
    pub fn new(
        user_id: impl Into<String>,
        channel_type: impl Into<String>,
        address: impl Into<String>,
        enabled: bool,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            channel_type: channel_type.into(),
            address: address.into(),
            enabled,
            updated_at: now_ms(),
        }
    }
}
