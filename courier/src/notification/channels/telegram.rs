//! Telegram Bot API notification channel.
//!
//! Sends messages via the Telegram Bot API (`POST /bot<token>/sendMessage`).
//! The recipient is the target chat id. Handles 429 rate limits by
//! respecting the `parameters.retry_after` field returned in the JSON
//! response body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{NotificationChannel, truncate_message};
use crate::notification::message::OutboundMessage;
use crate::utils::http_client::build_channel_client;
use crate::{DeliveryError, Error, Result};

/// Maximum number of retries for rate-limited requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Telegram Bot API token.
    pub bot_token: String,
    /// Parse mode for message formatting (HTML, Markdown, MarkdownV2).
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
    /// Bot API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_parse_mode() -> String {
    "HTML".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            parse_mode: default_parse_mode(),
            api_base: default_api_base(),
        }
    }
}

impl TelegramConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bot_token.trim().is_empty() {
            return Err(Error::validation("telegram: bot_token is required"));
        }
        if !matches!(self.parse_mode.as_str(), "HTML" | "Markdown" | "MarkdownV2") {
            return Err(Error::validation(format!(
                "telegram: unsupported parse_mode '{}'",
                self.parse_mode
            )));
        }
        Ok(())
    }
}

/// Telegram notification channel.
pub struct TelegramChannel {
    config: TelegramConfig,
    client: Client,
}

impl TelegramChannel {
    /// Create a new Telegram channel.
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: build_channel_client(Duration::ZERO),
        }
    }

    /// Build the message text.
    fn build_message(&self, message: &OutboundMessage) -> String {
        let text = if self.config.parse_mode == "HTML" {
            format!(
                "<b>{}</b>\n\n{}",
                escape_html(&message.subject),
                escape_html(&message.body)
            )
        } else {
            format!("*{}*\n\n{}", message.subject, message.body)
        };

        truncate_message(&text, TELEGRAM_MESSAGE_LIMIT)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    /// Send request with rate limit handling.
    async fn send_with_retry(&self, payload: &Value) -> Result<()> {
        let url = self.endpoint();
        let mut attempts = 0;

        loop {
            attempts += 1;

            // The token is part of the URL, so reqwest errors are reported
            // without it.
            let response = self
                .client
                .post(&url)
                .json(payload)
                .send()
                .await
                .map_err(|e| {
                    DeliveryError::send(format!("Telegram request failed: {}", e.without_url()))
                })?;

            let status = response.status();

            if status.is_success() {
                return Ok(());
            }

            if status.as_u16() == 429 {
                let body: Value = response.json().await.unwrap_or_default();

                let retry_after = body
                    .get("parameters")
                    .and_then(|p| p.get("retry_after"))
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_secs);

                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    warn!(
                        "Telegram rate limit: max retries ({}) exceeded, last retry_after was {:?}",
                        MAX_RATE_LIMIT_RETRIES, retry_after
                    );
                    return Err(DeliveryError::send(format!(
                        "Telegram rate limit exceeded after {} retries",
                        MAX_RATE_LIMIT_RETRIES
                    ))
                    .into());
                }

                let wait_duration = retry_after.unwrap_or(Duration::from_secs(1));
                debug!(
                    "Telegram rate limited (429), waiting {:?} before retry (attempt {}/{})",
                    wait_duration, attempts, MAX_RATE_LIMIT_RETRIES
                );
                tokio::time::sleep(wait_duration).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            warn!("Telegram sendMessage failed: {} - {}", status, body);
            return Err(DeliveryError::send(format!(
                "Telegram sendMessage failed: {status} - {body}"
            ))
            .into());
        }
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn channel_type(&self) -> &str {
        "telegram"
    }

    fn name(&self) -> &str {
        "Telegram"
    }

    fn is_enabled(&self) -> bool {
        !self.config.bot_token.trim().is_empty()
    }

    async fn send(&self, recipient: &str, message: &OutboundMessage) -> Result<()> {
        let chat_id = recipient.trim();
        if chat_id.is_empty() {
            return Err(DeliveryError::send("Telegram chat id is empty").into());
        }

        let payload = json!({
            "chat_id": chat_id,
            "text": self.build_message(message),
            "parse_mode": self.config.parse_mode,
        });

        self.send_with_retry(&payload).await?;

        debug!(entry_id = %message.entry_id, "Telegram notification sent");
        Ok(())
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        serde_json::from_value::<TelegramConfig>(config.clone())?.validate()
    }
}
