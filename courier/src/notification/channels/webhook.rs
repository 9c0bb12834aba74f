//! Generic webhook notification channel.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{NotificationChannel, non_empty, url_recipient};
use crate::notification::message::OutboundMessage;
use crate::utils::http_client::build_channel_client;
use crate::{DeliveryError, Error, Result};

/// Webhook channel configuration.
///
/// Authentication is stored flat so it maps one-to-one onto the catalog
/// form; [`WebhookConfig::auth`] assembles the typed variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL.
    pub url: String,
    /// HTTP method (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Custom headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// none, bearer, basic or header.
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub auth_username: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
    #[serde(default)]
    pub auth_header_name: Option<String>,
    #[serde(default)]
    pub auth_header_value: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_auth_type() -> String {
    "none".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Webhook authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAuth {
    /// Bearer token authentication.
    Bearer { token: String },
    /// Basic authentication.
    Basic { username: String, password: String },
    /// Custom header authentication.
    Header { name: String, value: String },
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: default_method(),
            headers: BTreeMap::new(),
            auth_type: default_auth_type(),
            auth_token: None,
            auth_username: None,
            auth_password: None,
            auth_header_name: None,
            auth_header_value: None,
            timeout_secs: default_timeout(),
        }
    }
}

impl WebhookConfig {
    /// Typed authentication, `Ok(None)` when `auth_type` is `none`.
    pub fn auth(&self) -> Result<Option<WebhookAuth>> {
        let missing = |field: &str| {
            Error::validation(format!(
                "webhook: {field} is required for {} auth",
                self.auth_type
            ))
        };

        let auth = match self.auth_type.to_ascii_lowercase().as_str() {
            "none" | "" => return Ok(None),
            "bearer" => WebhookAuth::Bearer {
                token: non_empty(&self.auth_token)
                    .ok_or_else(|| missing("auth_token"))?
                    .to_string(),
            },
            "basic" => WebhookAuth::Basic {
                username: non_empty(&self.auth_username)
                    .ok_or_else(|| missing("auth_username"))?
                    .to_string(),
                password: self.auth_password.clone().unwrap_or_default(),
            },
            "header" => WebhookAuth::Header {
                name: non_empty(&self.auth_header_name)
                    .ok_or_else(|| missing("auth_header_name"))?
                    .to_string(),
                value: non_empty(&self.auth_header_value)
                    .ok_or_else(|| missing("auth_header_value"))?
                    .to_string(),
            },
            other => {
                return Err(Error::validation(format!(
                    "webhook: unsupported auth_type '{other}'"
                )));
            }
        };
        Ok(Some(auth))
    }

    pub fn validate(&self) -> Result<()> {
        if url_recipient(&self.url).is_none() {
            return Err(Error::validation("webhook: url must be an http(s) URL"));
        }
        if !matches!(self.method.to_ascii_uppercase().as_str(), "POST" | "PUT") {
            return Err(Error::validation(format!(
                "webhook: unsupported method '{}'",
                self.method
            )));
        }
        if let Some(WebhookAuth::Header { name, .. }) = self.auth()?
            && name.parse::<HeaderName>().is_err()
        {
            return Err(Error::validation(format!(
                "webhook: invalid auth header name '{name}'"
            )));
        }
        Ok(())
    }
}

/// Generic webhook notification channel.
pub struct WebhookChannel {
    config: WebhookConfig,
    auth: Option<WebhookAuth>,
    client: Client,
}

impl WebhookChannel {
    /// Create a new Webhook channel.
    ///
    /// Invalid auth settings are dropped with a warning; use
    /// [`WebhookConfig::validate`] to reject them up front.
    pub fn new(config: WebhookConfig) -> Self {
        let auth = config.auth().unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring invalid webhook auth settings");
            None
        });
        let client = build_channel_client(Duration::from_secs(config.timeout_secs));

        Self {
            config,
            auth,
            client,
        }
    }

    /// Build the request headers.
    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), value.parse::<HeaderValue>())
            {
                headers.insert(name, value);
            }
        }

        match &self.auth {
            Some(WebhookAuth::Bearer { token }) => {
                if let Ok(value) = format!("Bearer {token}").parse() {
                    headers.insert(AUTHORIZATION, value);
                }
            }
            Some(WebhookAuth::Header { name, value }) => {
                if let (Ok(name), Ok(value)) =
                    (name.parse::<HeaderName>(), value.parse::<HeaderValue>())
                {
                    headers.insert(name, value);
                }
            }
            // Basic auth is applied on the request builder.
            Some(WebhookAuth::Basic { .. }) | None => {}
        }

        headers
    }

    /// Build the JSON payload.
    fn build_payload(&self, recipient: &str, message: &OutboundMessage) -> Value {
        json!({
            "id": message.entry_id,
            "recipient": recipient,
            "subject": message.subject,
            "body": message.body,
            "priority": message.priority,
            "variables": message.variables,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }

    /// A URL recipient overrides the configured endpoint.
    fn target_url(&self, recipient: &str) -> String {
        url_recipient(recipient)
            .map(|u| u.to_string())
            .unwrap_or_else(|| self.config.url.clone())
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn channel_type(&self) -> &str {
        "webhook"
    }

    fn name(&self) -> &str {
        "Webhook"
    }

    fn is_enabled(&self) -> bool {
        !self.config.url.trim().is_empty()
    }

    async fn send(&self, recipient: &str, message: &OutboundMessage) -> Result<()> {
        let url = self.target_url(recipient);
        let payload = self.build_payload(recipient, message);

        let mut request = match self.config.method.to_ascii_uppercase().as_str() {
            "PUT" => self.client.put(&url),
            _ => self.client.post(&url),
        };

        request = request.headers(self.build_headers()).json(&payload);

        if let Some(WebhookAuth::Basic { username, password }) = &self.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::send(format!("Webhook request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Webhook failed: {} - {}", status, body);
            return Err(DeliveryError::send(format!("Webhook failed: {status} - {body}")).into());
        }

        debug!(entry_id = %message.entry_id, "Webhook notification sent");
        Ok(())
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        serde_json::from_value::<WebhookConfig>(config.clone())?.validate()
    }
}
