//! Email notification channel using SMTP.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{NotificationChannel, non_empty};
use crate::notification::message::OutboundMessage;
use crate::utils::http_client::install_rustls_provider;
use crate::{DeliveryError, Error, Result};

/// SMTP command timeout.
const SMTP_TIMEOUT: Duration = Duration::from_secs(20);

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailTlsMode {
    /// Plain connection upgraded with STARTTLS (port 587).
    #[default]
    Starttls,
    /// Implicit TLS (port 465).
    Tls,
    /// No encryption. Only for local relays.
    None,
}

/// Email channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// SMTP server host.
    pub smtp_host: String,
    /// SMTP server port.
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// SMTP username.
    #[serde(default)]
    pub smtp_username: Option<String>,
    /// SMTP password.
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub tls_mode: EmailTlsMode,
    /// Sender email address.
    pub from_address: String,
    /// Sender display name.
    #[serde(default)]
    pub from_name: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "localhost".to_string(),
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            tls_mode: EmailTlsMode::Starttls,
            from_address: String::new(),
            from_name: None,
        }
    }
}

impl EmailConfig {
    pub fn validate(&self) -> Result<()> {
        if self.smtp_host.trim().is_empty() {
            return Err(Error::validation("email: smtp_host is required"));
        }
        self.sender()?;
        Ok(())
    }

    fn sender(&self) -> Result<Mailbox> {
        let address = self
            .from_address
            .trim()
            .parse()
            .map_err(|e| Error::validation(format!("email: invalid from_address: {e}")))?;
        Ok(Mailbox::new(
            non_empty(&self.from_name).map(str::to_string),
            address,
        ))
    }

    fn build_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        install_rustls_provider();
        let host = self.smtp_host.trim();
        let builder = match self.tls_mode {
            EmailTlsMode::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| Error::config(format!("email: SMTP relay setup failed: {e}")))?,
            EmailTlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| Error::config(format!("email: SMTP relay setup failed: {e}")))?,
            EmailTlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
        };

        let mut builder = builder.port(self.smtp_port).timeout(Some(SMTP_TIMEOUT));
        if let (Some(username), Some(password)) = (
            non_empty(&self.smtp_username),
            self.smtp_password.as_deref(),
        ) {
            builder = builder.credentials(Credentials::new(
                username.to_string(),
                password.to_string(),
            ));
        }

        Ok(builder.build())
    }
}

/// Email notification channel.
pub struct EmailChannel {
    config: EmailConfig,
    sender: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailChannel {
    /// Create a new Email channel.
    pub fn new(config: EmailConfig) -> Result<Self> {
        config.validate()?;
        let sender = config.sender()?;
        let transport = config.build_transport()?;
        Ok(Self {
            config,
            sender,
            transport,
        })
    }

    fn build_message(&self, recipient: &str, message: &OutboundMessage) -> Result<Message> {
        let to: Mailbox = recipient.trim().parse().map_err(|e| {
            DeliveryError::send(format!("invalid email recipient '{recipient}': {e}"))
        })?;

        Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(message.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| DeliveryError::send(format!("failed to build email: {e}")).into())
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn channel_type(&self) -> &str {
        "email"
    }

    fn name(&self) -> &str {
        "Email"
    }

    fn is_enabled(&self) -> bool {
        !self.config.smtp_host.trim().is_empty() && !self.config.from_address.trim().is_empty()
    }

    async fn send(&self, recipient: &str, message: &OutboundMessage) -> Result<()> {
        let email = self.build_message(recipient, message)?;

        self.transport
            .send(email)
            .await
            .map_err(|e| DeliveryError::send(format!("SMTP send failed: {e}")))?;

        debug!(entry_id = %message.entry_id, "Email notification sent");
        Ok(())
    }

    /// With an empty recipient only the SMTP handshake is checked.
    async fn test(&self, recipient: &str) -> Result<()> {
        if recipient.trim().is_empty() {
            let ok = self
                .transport
                .test_connection()
                .await
                .map_err(|e| DeliveryError::send(format!("SMTP connection failed: {e}")))?;
            if !ok {
                return Err(DeliveryError::send("SMTP server rejected the connection").into());
            }
            return Ok(());
        }
        self.send(recipient, &OutboundMessage::test_message()).await
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        serde_json::from_value::<EmailConfig>(config.clone())?.validate()
    }
}
