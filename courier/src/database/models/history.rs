//! Delivery history database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// One delivery attempt. Append-only.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HistoryRecordDbModel {
    pub id: String,
    pub queue_entry_id: String,
    pub user_id: Option<String>,
    pub channel_type: String,
    /// Status: delivered, failed, dead_letter
    pub status: String,
    /// Subject as sent (after template rendering)
    pub subject: String,
    pub body: String,
    pub error_message: Option<String>,
    /// JSON blob of [`HistoryMetadata`]
    pub metadata: String,
    pub created_at: i64,
}

impl HistoryRecordDbModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue_entry_id: impl Into<String>,
        user_id: Option<String>,
        channel_type: impl Into<String>,
        status: HistoryStatus,
        subject: impl Into<String>,
        body: impl Into<String>,
        error_message: Option<String>,
        metadata: &HistoryMetadata,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue_entry_id: queue_entry_id.into(),
            user_id,
            channel_type: channel_type.into(),
            status: status.as_str().to_string(),
            subject: subject.into(),
            body: body.into(),
            error_message,
            metadata: serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string()),
            created_at: now_ms(),
        }
    }

    /// Parse the metadata blob; malformed blobs yield defaults.
    pub fn metadata(&self) -> HistoryMetadata {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }
}

/// Outcome recorded for an attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Delivered,
    /// Failed with a retry scheduled.
    Failed,
    /// Failed and the entry was moved to the dead-letter state.
    DeadLetter,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }
}

/// Small metadata blob attached to each attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMetadata {
    /// Entry retry count after this attempt.
    pub retry_count: i64,
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}
