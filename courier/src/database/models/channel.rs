//! Channel state database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Live state of one channel type.
/// Rows are seeded from the channel catalog and never deleted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChannelStateDbModel {
    pub channel_type: String,
    pub display_name: String,
    pub enabled: bool,
    /// State: disabled, enabled, testing, failed
    pub state: String,
    /// JSON object matching the channel definition's fields
    pub config: String,
    pub last_test_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub last_error: Option<String>,
    pub failure_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ChannelStateDbModel {
    /// A disabled, unconfigured row for `channel_type`.
    pub fn new(channel_type: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            channel_type: channel_type.into(),
            display_name: display_name.into(),
            enabled: false,
            state: ChannelStatus::Disabled.as_str().to_string(),
            config: "{}".to_string(),
            last_test_at: None,
            last_success_at: None,
            last_error: None,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> Option<ChannelStatus> {
        ChannelStatus::parse(&self.state)
    }
}

/// Channel health states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Disabled,
    Enabled,
    /// A connectivity test is in progress.
    Testing,
    /// The failure threshold was reached; cleared by a success.
    Failed,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Testing => "testing",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(Self::Disabled),
            "enabled" => Some(Self::Enabled),
            "testing" => Some(Self::Testing),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}
