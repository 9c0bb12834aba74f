//! Notification channels.
//!
//! Shipped implementations:
//! - Email (SMTP via lettre)
//! - Discord webhooks
//! - Telegram Bot API
//! - Generic webhooks (HTTP POST/PUT)
//!
//! Other catalog entries have no implementation; entries queued for them
//! fail with `ChannelNotFound` and follow the normal retry path.

mod discord;
mod email;
mod telegram;
mod webhook;

pub use discord::{DiscordChannel, DiscordConfig};
pub use email::{EmailChannel, EmailConfig, EmailTlsMode};
pub use telegram::{TelegramChannel, TelegramConfig};
pub use webhook::{WebhookAuth, WebhookChannel, WebhookConfig};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::OutboundMessage;
use crate::Result;

/// Trait for notification channels.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel type key, matching the catalog.
    fn channel_type(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Whether the channel has what it needs to send.
    fn is_enabled(&self) -> bool;

    /// Deliver `message` to `recipient`.
    ///
    /// The recipient format is channel specific (address, chat id, URL).
    async fn send(&self, recipient: &str, message: &OutboundMessage) -> Result<()>;

    /// Check connectivity, optionally sending a test message to `recipient`.
    async fn test(&self, recipient: &str) -> Result<()> {
        self.send(recipient, &OutboundMessage::test_message()).await
    }

    /// Validate a configuration object for this channel type.
    fn validate_config(&self, config: &Value) -> Result<()>;
}

/// Typed configuration of a channel type with a shipped implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Discord(DiscordConfig),
    Email(EmailConfig),
    Telegram(TelegramConfig),
    Webhook(WebhookConfig),
}

impl ChannelConfig {
    /// Parse the stored configuration of `channel_type`.
    ///
    /// Returns `Ok(None)` for types without a typed config.
    pub fn from_settings(channel_type: &str, config: &Value) -> Result<Option<Self>> {
        let parsed = match channel_type {
            "discord" => Self::Discord(serde_json::from_value(config.clone())?),
            "email" => Self::Email(serde_json::from_value(config.clone())?),
            "telegram" => Self::Telegram(serde_json::from_value(config.clone())?),
            "webhook" => Self::Webhook(serde_json::from_value(config.clone())?),
            _ => return Ok(None),
        };
        parsed.validate()?;
        Ok(Some(parsed))
    }

    /// Get the channel type name.
    pub fn channel_type(&self) -> &'static str {
        match self {
            Self::Discord(_) => "discord",
            Self::Email(_) => "email",
            Self::Telegram(_) => "telegram",
            Self::Webhook(_) => "webhook",
        }
    }

    /// Semantic checks beyond what the catalog schema covers.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Discord(c) => c.validate(),
            Self::Email(c) => c.validate(),
            Self::Telegram(c) => c.validate(),
            Self::Webhook(c) => c.validate(),
        }
    }

    /// Build the live channel for this configuration.
    pub fn build_channel(&self) -> Result<Arc<dyn NotificationChannel>> {
        let channel: Arc<dyn NotificationChannel> = match self {
            Self::Discord(c) => Arc::new(DiscordChannel::new(c.clone())),
            Self::Email(c) => Arc::new(EmailChannel::new(c.clone())?),
            Self::Telegram(c) => Arc::new(TelegramChannel::new(c.clone())),
            Self::Webhook(c) => Arc::new(WebhookChannel::new(c.clone())),
        };
        Ok(channel)
    }
}

/// `Some(s)` if `s` holds more than whitespace.
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Truncate `text` to at most `limit` characters, marking the cut.
pub(crate) fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let suffix = "\n\n[truncated]";
    let budget = limit.saturating_sub(suffix.len());
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}

/// Recipient override if it is an http(s) URL.
pub(crate) fn url_recipient(recipient: &str) -> Option<url::Url> {
    let parsed = url::Url::parse(recipient.trim()).ok()?;
    matches!(parsed.scheme(), "http" | "https").then_some(parsed)
}
