//! Application-wide error types.

use std::time::Duration;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Why a single delivery attempt did not succeed.
///
/// Every variant consumes one retry of the queue entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("no channel implementation registered for type '{0}'")]
    ChannelNotFound(String),

    #[error("channel '{0}' is disabled")]
    ChannelDisabled(String),

    #[error("no recipient could be resolved for channel '{channel_type}'")]
    RecipientUnresolved { channel_type: String },

    #[error("{0}")]
    Send(String),

    #[error("channel call timed out after {0:?}")]
    Timeout(Duration),
}

impl DeliveryError {
    pub fn send(msg: impl Into<String>) -> Self {
        Self::Send(msg.into())
    }

    /// Short machine-readable tag, stored in history metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChannelNotFound(_) => "channel_not_found",
            Self::ChannelDisabled(_) => "channel_disabled",
            Self::RecipientUnresolved { .. } => "recipient_unresolved",
            Self::Send(_) => "send_failed",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl From<Error> for DeliveryError {
    fn from(err: Error) -> Self {
        match err {
            Error::Delivery(inner) => inner,
            other => Self::Send(other.to_string()),
        }
    }
}
