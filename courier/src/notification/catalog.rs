//! Static catalog of channel types and their configuration schemas.
//!
//! The catalog is the source of truth for which channel types exist. Some
//! entries (`sms`, `pushover`, `slack`) have no shipped implementation and
//! only drive the admin UI; entries for them still get a state row.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Broad grouping used by the admin UI.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChannelCategory {
    Email,
    Chat,
    Sms,
    Push,
    Webhook,
}

/// Input kind of a configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Password,
    Number,
    Url,
    Email,
    Boolean,
    Select,
}

/// One configuration field of a channel definition.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigField {
    pub key: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<&'static str>,
    /// Allowed values for `select` fields.
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    pub options: &'static [&'static str],
}

impl ConfigField {
    const fn new(key: &'static str, label: &'static str, kind: FieldKind) -> Self {
        Self {
            key,
            label,
            kind,
            required: false,
            default: None,
            help: None,
            options: &[],
        }
    }

    const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    const fn default_value(mut self, value: &'static str) -> Self {
        self.default = Some(value);
        self
    }

    const fn help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }

    const fn options(mut self, options: &'static [&'static str]) -> Self {
        self.options = options;
        self
    }

    /// Typed JSON form of the field's default.
    fn default_json(&self) -> Option<Value> {
        let raw = self.default?;
        Some(match self.kind {
            FieldKind::Number => raw
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(raw)),
            FieldKind::Boolean => Value::Bool(raw == "true"),
            _ => Value::from(raw),
        })
    }

    /// Check a single present, non-empty value against the field kind.
    /// Returns the normalized value.
    fn check(&self, value: &Value) -> std::result::Result<Value, String> {
        match self.kind {
            FieldKind::Text | FieldKind::Password => match value {
                Value::String(_) => Ok(value.clone()),
                _ => Err("expected a string".to_string()),
            },
            FieldKind::Number => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| format!("'{s}' is not a number")),
                _ => Err("expected a number".to_string()),
            },
            FieldKind::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(s) if s == "true" || s == "false" => Ok(Value::Bool(s == "true")),
                _ => Err("expected a boolean".to_string()),
            },
            FieldKind::Url => {
                let s = value.as_str().ok_or("expected a URL string")?;
                let parsed = url::Url::parse(s).map_err(|e| format!("invalid URL: {e}"))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(format!("unsupported URL scheme '{}'", parsed.scheme()));
                }
                Ok(value.clone())
            }
            FieldKind::Email => {
                let s = value.as_str().ok_or("expected an email address")?;
                if !is_plausible_email(s) {
                    return Err(format!("'{s}' is not an email address"));
                }
                Ok(value.clone())
            }
            FieldKind::Select => {
                let s = value.as_str().ok_or("expected one of the listed options")?;
                if !self.options.contains(&s) {
                    return Err(format!(
                        "'{s}' is not one of: {}",
                        self.options.join(", ")
                    ));
                }
                Ok(value.clone())
            }
        }
    }
}

pub(crate) fn is_plausible_email(s: &str) -> bool {
    let Some((local, domain)) = s.trim().rsplit_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Static description of one channel type.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelDefinition {
    pub channel_type: &'static str,
    pub display_name: &'static str,
    pub category: ChannelCategory,
    pub description: &'static str,
    pub fields: Vec<ConfigField>,
}

impl ChannelDefinition {
    pub fn field(&self, key: &str) -> Option<&ConfigField> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Validate a configuration object against this definition.
    ///
    /// Required fields must be present and non-empty; present values must
    /// match their field kind. Missing optional fields with a default are
    /// filled in. Keys not described by the definition are kept as-is.
    pub fn validate_config(&self, config: &Value) -> Result<Value> {
        let Value::Object(input) = config else {
            return Err(Error::validation(format!(
                "{} configuration must be a JSON object",
                self.channel_type
            )));
        };

        let mut errors = Vec::new();
        let mut output: Map<String, Value> = input.clone();

        for field in &self.fields {
            match input.get(field.key) {
                Some(value) if !is_blank(value) => match field.check(value) {
                    Ok(normalized) => {
                        output.insert(field.key.to_string(), normalized);
                    }
                    Err(msg) => errors.push(format!("{}: {msg}", field.key)),
                },
                _ if field.required => errors.push(format!("{}: is required", field.key)),
                _ => {
                    if let Some(default) = field.default_json() {
                        output.insert(field.key.to_string(), default);
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Err(Error::validation(format!(
                "invalid {} configuration: {}",
                self.channel_type,
                errors.join("; ")
            )));
        }

        Ok(Value::Object(output))
    }
}

const EMAIL_TLS_MODES: &[&str] = &["starttls", "tls", "none"];
const TELEGRAM_PARSE_MODES: &[&str] = &["HTML", "Markdown", "MarkdownV2"];
const WEBHOOK_METHODS: &[&str] = &["POST", "PUT"];
const WEBHOOK_AUTH_TYPES: &[&str] = &["none", "bearer", "basic", "header"];
const SMS_PROVIDERS: &[&str] = &["twilio"];

/// Immutable list of channel definitions.
#[derive(Debug, Clone)]
pub struct ChannelCatalog {
    definitions: Vec<ChannelDefinition>,
}

impl ChannelCatalog {
    pub fn new(definitions: Vec<ChannelDefinition>) -> Self {
        Self { definitions }
    }

    /// The built-in channel types.
    pub fn builtin() -> Self {
        use FieldKind::*;

        Self::new(vec![
            ChannelDefinition {
                channel_type: "email",
                display_name: "Email",
                category: ChannelCategory::Email,
                description: "Deliver notifications over SMTP.",
                fields: vec![
                    ConfigField::new("smtp_host", "SMTP host", Text).required(),
                    ConfigField::new("smtp_port", "SMTP port", Number).default_value("587"),
                    ConfigField::new("smtp_username", "Username", Text),
                    ConfigField::new("smtp_password", "Password", Password),
                    ConfigField::new("tls_mode", "Encryption", Select)
                        .default_value("starttls")
                        .options(EMAIL_TLS_MODES),
                    ConfigField::new("from_address", "From address", Email).required(),
                    ConfigField::new("from_name", "From name", Text),
                ],
            },
            ChannelDefinition {
                channel_type: "discord",
                display_name: "Discord",
                category: ChannelCategory::Chat,
                description: "Post to a Discord channel through an incoming webhook.",
                fields: vec![
                    ConfigField::new("webhook_url", "Webhook URL", Url).required(),
                    ConfigField::new("username", "Bot username", Text),
                    ConfigField::new("avatar_url", "Avatar URL", Url),
                ],
            },
            ChannelDefinition {
                channel_type: "telegram",
                display_name: "Telegram",
                category: ChannelCategory::Chat,
                description: "Send messages with the Telegram Bot API.",
                fields: vec![
                    ConfigField::new("bot_token", "Bot token", Password)
                        .required()
                        .help("Token issued by @BotFather"),
                    ConfigField::new("parse_mode", "Parse mode", Select)
                        .default_value("HTML")
                        .options(TELEGRAM_PARSE_MODES),
                ],
            },
            ChannelDefinition {
                channel_type: "sms",
                display_name: "SMS",
                category: ChannelCategory::Sms,
                description: "Text messages through an SMS gateway.",
                fields: vec![
                    ConfigField::new("provider", "Provider", Select)
                        .default_value("twilio")
                        .options(SMS_PROVIDERS),
                    ConfigField::new("account_sid", "Account SID", Text).required(),
                    ConfigField::new("auth_token", "Auth token", Password).required(),
                    ConfigField::new("from_number", "From number", Text)
                        .required()
                        .help("E.164 format, e.g. +15551234567"),
                ],
            },
            ChannelDefinition {
                channel_type: "pushover",
                display_name: "Pushover",
                category: ChannelCategory::Push,
                description: "Push notifications to Pushover devices.",
                fields: vec![
                    ConfigField::new("app_token", "Application token", Password).required(),
                    ConfigField::new("user_key", "User key", Password).required(),
                ],
            },
            ChannelDefinition {
                channel_type: "slack",
                display_name: "Slack",
                category: ChannelCategory::Chat,
                description: "Post to Slack through an incoming webhook.",
                fields: vec![
                    ConfigField::new("webhook_url", "Webhook URL", Url).required(),
                    ConfigField::new("channel", "Channel override", Text),
                ],
            },
            ChannelDefinition {
                channel_type: "webhook",
                display_name: "Webhook",
                category: ChannelCategory::Webhook,
                description: "POST a JSON payload to an HTTP endpoint.",
                fields: vec![
                    ConfigField::new("url", "Endpoint URL", Url).required(),
                    ConfigField::new("method", "HTTP method", Select)
                        .default_value("POST")
                        .options(WEBHOOK_METHODS),
                    ConfigField::new("auth_type", "Authentication", Select)
                        .default_value("none")
                        .options(WEBHOOK_AUTH_TYPES),
                    ConfigField::new("auth_token", "Bearer token", Password),
                    ConfigField::new("auth_username", "Basic auth username", Text),
                    ConfigField::new("auth_password", "Basic auth password", Password),
                    ConfigField::new("auth_header_name", "Auth header name", Text),
                    ConfigField::new("auth_header_value", "Auth header value", Password),
                    ConfigField::new("timeout_secs", "Timeout (seconds)", Number)
                        .default_value("30"),
                ],
            },
        ])
    }

    pub fn get(&self, channel_type: &str) -> Option<&ChannelDefinition> {
        self.definitions
            .iter()
            .find(|d| d.channel_type == channel_type)
    }

    pub fn definitions(&self) -> &[ChannelDefinition] {
        &self.definitions
    }

    /// Definitions grouped by category, catalog order kept within a group.
    /// Groups appear in order of their first definition.
    pub fn by_category(&self) -> Vec<(ChannelCategory, Vec<&ChannelDefinition>)> {
        let mut groups: Vec<(ChannelCategory, Vec<&ChannelDefinition>)> = Vec::new();
        for def in &self.definitions {
            match groups.iter_mut().find(|(cat, _)| *cat == def.category) {
                Some((_, defs)) => defs.push(def),
                None => groups.push((def.category, vec![def])),
            }
        }
        groups
    }

    /// Validate `config` for `channel_type`.
    pub fn validate_config(&self, channel_type: &str, config: &Value) -> Result<Value> {
        self.get(channel_type)
            .ok_or_else(|| Error::not_found("ChannelDefinition", channel_type))?
            .validate_config(config)
    }
}

impl Default for ChannelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_types_unique() {
        let catalog = ChannelCatalog::builtin();
        let mut types: Vec<_> = catalog.definitions().iter().map(|d| d.channel_type).collect();
        let total = types.len();
        types.sort();
        types.dedup();
        assert_eq!(types.len(), total);
        for t in ["email", "discord", "telegram", "webhook", "sms", "pushover", "slack"] {
            assert!(catalog.get(t).is_some(), "{t} missing");
        }
    }

    #[test]
    fn test_by_category_keeps_order() {
        let catalog = ChannelCatalog::builtin();
        let groups = catalog.by_category();
        let (cat, chat) = &groups[1];
        assert_eq!(*cat, ChannelCategory::Chat);
        let names: Vec<_> = chat.iter().map(|d| d.channel_type).collect();
        assert_eq!(names, vec!["discord", "telegram", "slack"]);
        assert_eq!(groups.len(), 5);
    }

    #[test]
    fn test_validate_fills_defaults() {
        let catalog = ChannelCatalog::builtin();
        let config = catalog
            .validate_config(
                "email",
                &json!({ "smtp_host": "smtp.example.com", "from_address": "wx@example.com" }),
            )
            .unwrap();
        assert_eq!(config["smtp_port"], 587);
        assert_eq!(config["tls_mode"], "starttls");
        assert!(config.get("from_name").is_none());
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let catalog = ChannelCatalog::builtin();
        let err = catalog
            .validate_config(
                "email",
                &json!({ "smtp_host": "", "smtp_port": "abc", "tls_mode": "ssl", "from_address": "nope" }),
            )
            .unwrap_err()
            .to_string();
        assert!(err.contains("smtp_host: is required"));
        assert!(err.contains("smtp_port"));
        assert!(err.contains("tls_mode"));
        assert!(err.contains("from_address"));
    }

    #[test]
    fn test_validate_number_string_normalized() {
        let catalog = ChannelCatalog::builtin();
        let config = catalog
            .validate_config(
                "webhook",
                &json!({ "url": "https://hooks.example.com/x", "timeout_secs": "10" }),
            )
            .unwrap();
        assert_eq!(config["timeout_secs"], 10);
        assert_eq!(config["method"], "POST");
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let catalog = ChannelCatalog::builtin();
        assert!(
            catalog
                .validate_config("discord", &json!({ "webhook_url": "ftp://example.com" }))
                .is_err()
        );
        assert!(catalog.validate_config("discord", &json!("str")).is_err());
    }

    #[test]
    fn test_unknown_type() {
        let catalog = ChannelCatalog::builtin();
        assert!(matches!(
            catalog.validate_config("pager", &json!({})),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_plausible_email() {
        assert!(is_plausible_email("a@b.io"));
        assert!(!is_plausible_email("a@b"));
        assert!(!is_plausible_email("@b.io"));
        assert!(!is_plausible_email("plain"));
    }
}
