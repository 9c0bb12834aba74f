//! Discord webhook notification channel.
//!
//! Implements Discord's recommended rate limit handling:
//! - No hardcoded rate limits
//! - Retries on 429 responses respecting the Retry-After header

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{NotificationChannel, non_empty, truncate_message, url_recipient};
use crate::notification::message::OutboundMessage;
use crate::utils::http_client::build_channel_client;
use crate::{DeliveryError, Error, Result};

/// Maximum number of retries for rate-limited requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Embed description limit.
const EMBED_DESCRIPTION_LIMIT: usize = 4096;
/// Embed title limit.
const EMBED_TITLE_LIMIT: usize = 256;

/// Discord channel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Discord webhook URL.
    pub webhook_url: String,
    /// Optional username for the webhook.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional avatar URL for the webhook.
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl DiscordConfig {
    pub fn validate(&self) -> Result<()> {
        if url_recipient(&self.webhook_url).is_none() {
            return Err(Error::validation(
                "discord: webhook_url must be an http(s) URL",
            ));
        }
        Ok(())
    }
}

/// Discord notification channel.
pub struct DiscordChannel {
    config: DiscordConfig,
    client: Client,
}

impl DiscordChannel {
    /// Create a new Discord channel.
    pub fn new(config: DiscordConfig) -> Self {
        Self {
            config,
            client: build_channel_client(Duration::ZERO),
        }
    }

    /// Embed color by priority.
    fn get_color(priority: i64) -> u32 {
        match priority {
            p if p >= 10 => 0xe74c3c, // Red
            p if p >= 5 => 0xf39c12,  // Orange
            p if p > 0 => 0x3498db,   // Blue
            _ => 0x808080,            // Gray
        }
    }

    /// Build the webhook payload for a message.
    fn build_payload(&self, message: &OutboundMessage) -> Value {
        let embed = json!({
            "title": truncate_message(&message.subject, EMBED_TITLE_LIMIT),
            "description": truncate_message(&message.body, EMBED_DESCRIPTION_LIMIT),
            "color": Self::get_color(message.priority),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "footer": {
                "text": format!("Priority: {}", message.priority)
            }
        });

        let mut payload = json!({
            "embeds": [embed]
        });

        if let Some(username) = non_empty(&self.config.username) {
            payload["username"] = json!(username);
        }
        if let Some(avatar_url) = non_empty(&self.config.avatar_url) {
            payload["avatar_url"] = json!(avatar_url);
        }

        payload
    }

    /// Target webhook: a URL recipient overrides the configured one.
    fn target_url(&self, recipient: &str) -> String {
        url_recipient(recipient)
            .map(|u| u.to_string())
            .unwrap_or_else(|| self.config.webhook_url.clone())
    }

    /// Send request with rate limit handling.
    /// Retries on 429 responses respecting the Retry-After header.
    async fn send_with_retry(&self, url: &str, payload: &Value) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let response = self
                .client
                .post(url)
                .json(payload)
                .send()
                .await
                .map_err(|e| DeliveryError::send(format!("Discord request failed: {e}")))?;

            let status = response.status();

            if status.is_success() {
                return Ok(());
            }

            if status.as_u16() == 429 {
                let retry_after = parse_retry_after(&response);

                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    warn!(
                        "Discord rate limit: max retries ({}) exceeded, last retry_after was {:?}",
                        MAX_RATE_LIMIT_RETRIES, retry_after
                    );
                    return Err(DeliveryError::send(format!(
                        "Discord rate limit exceeded after {} retries",
                        MAX_RATE_LIMIT_RETRIES
                    ))
                    .into());
                }

                let wait_duration = retry_after.unwrap_or(Duration::from_secs(1));
                debug!(
                    "Discord rate limited (429), waiting {:?} before retry (attempt {}/{})",
                    wait_duration, attempts, MAX_RATE_LIMIT_RETRIES
                );
                tokio::time::sleep(wait_duration).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            warn!("Discord webhook failed: {} - {}", status, body);
            return Err(
                DeliveryError::send(format!("Discord webhook failed: {status} - {body}")).into(),
            );
        }
    }
}

/// Parse the Retry-After duration from a 429 response.
fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    let headers = response.headers();
    ["Retry-After", "X-RateLimit-Reset-After"]
        .iter()
        .find_map(|name| headers.get(*name)?.to_str().ok()?.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[async_trait]
impl NotificationChannel for DiscordChannel {
    fn channel_type(&self) -> &str {
        "discord"
    }

    fn name(&self) -> &str {
        "Discord"
    }

    fn is_enabled(&self) -> bool {
        !self.config.webhook_url.trim().is_empty()
    }

    async fn send(&self, recipient: &str, message: &OutboundMessage) -> Result<()> {
        let url = self.target_url(recipient);
        let payload = self.build_payload(message);
        self.send_with_retry(&url, &payload).await?;

        debug!(entry_id = %message.entry_id, "Discord notification sent");
        Ok(())
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        serde_json::from_value::<DiscordConfig>(config.clone())?.validate()
    }
}
