//! Outbound message payloads and `{{name}}` template rendering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Variables attached to a queue entry.
///
/// Stored as a JSON object; used both for template rendering and as the
/// last-resort source of a recipient address (`recipient` key).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(BTreeMap<String, Value>);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value for `key`, ignoring empty strings and non-string values.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse a stored variables blob. Anything that is not a JSON object
    /// yields an empty set.
    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }

    fn render_value(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => Some(String::new()),
            other => Some(other.to_string()),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Variables {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Replace `{{ name }}` placeholders with values from `vars`.
///
/// Unknown names and unterminated placeholders are left as written.
pub fn render_template(template: &str, vars: &Variables) -> String {
    if vars.is_empty() || !template.contains("{{") {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = after_open[..end].trim();
        match vars.render_value(key) {
            Some(value) if !key.is_empty() => out.push_str(&value),
            _ => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}

/// A rendered message handed to a channel.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    /// Queue entry this message belongs to.
    pub entry_id: String,
    pub subject: String,
    pub body: String,
    pub priority: i64,
    pub variables: Variables,
}

impl OutboundMessage {
    /// Render subject and body against the entry's variables.
    pub fn render(
        entry_id: impl Into<String>,
        subject: &str,
        body: &str,
        priority: i64,
        variables: Variables,
    ) -> Self {
        Self {
            entry_id: entry_id.into(),
            subject: render_template(subject, &variables),
            body: render_template(body, &variables),
            priority,
            variables,
        }
    }

    /// Fixed message used by connectivity tests.
    pub fn test_message() -> Self {
        Self {
            entry_id: "test".to_string(),
            subject: "courier test notification".to_string(),
            body: "This is a test notification. If you can read it, the channel works."
                .to_string(),
            priority: 0,
            variables: Variables::new(),
        }
    }
}
