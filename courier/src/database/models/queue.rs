//! Notification queue database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Notification queue entry database model.
/// One row per notification to deliver through a single channel.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueEntryDbModel {
    pub id: String,
    /// Recipient user, used for per-user address lookup
    pub user_id: Option<String>,
    /// Channel type key (email, discord, ...)
    pub channel_type: String,
    pub template_id: Option<String>,
    /// Higher values are claimed first
    pub priority: i64,
    /// State: created, queued, sending, delivered, failed, dead_letter
    pub state: String,
    pub subject: String,
    pub body: String,
    /// JSON object of template/recipient variables
    pub variables: String,
    pub retry_count: i64,
    /// Snapshot of the retry budget at enqueue time
    pub max_retries: i64,
    /// Unix epoch ms; only set while a retry is scheduled
    pub next_retry_at: Option<i64>,
    pub delivered_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl QueueEntryDbModel {
    pub fn new(
        channel_type: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        priority: i64,
        max_retries: i64,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            channel_type: channel_type.into(),
            template_id: None,
            priority,
            state: QueueState::Created.as_str().to_string(),
            subject: subject.into(),
            body: body.into(),
            variables: "{}".to_string(),
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            delivered_at: None,
            failed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Parsed state, `None` if the row holds an unknown value.
    pub fn queue_state(&self) -> Option<QueueState> {
        QueueState::parse(&self.state)
    }
}

/// Queue entry lifecycle states.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Freshly enqueued, never attempted.
    Created,
    /// Waiting for a worker (set by operator requeue and crash recovery).
    Queued,
    /// Claimed by a worker; excluded from further claims.
    Sending,
    /// Terminal success.
    Delivered,
    /// Last attempt failed; a retry is scheduled at `next_retry_at`.
    Failed,
    /// Terminal failure after exhausting the retry budget.
    DeadLetter,
}

impl QueueState {
    pub const ALL: [QueueState; 6] = [
        Self::Created,
        Self::Queued,
        Self::Sending,
        Self::Delivered,
        Self::Failed,
        Self::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "queued" => Some(Self::Queued),
            "sending" => Some(Self::Sending),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::DeadLetter)
    }

    /// States a worker may claim from (subject to `next_retry_at`).
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Created | Self::Queued | Self::Failed)
    }
}
