//! Recipient address resolution for queue entries.

use std::sync::Arc;

use tracing::debug;

use super::message::Variables;
use crate::database::repositories::RecipientDirectory;
use crate::{DeliveryError, Result};

/// Channel type whose recipients fall back to the user's primary email.
pub const DEFAULT_EMAIL_CHANNEL: &str = "email";

/// Variable consulted when no directory address applies.
pub const RECIPIENT_VARIABLE: &str = "recipient";

/// Resolves the address an entry should be delivered to.
pub struct RecipientResolver {
    directory: Arc<dyn RecipientDirectory>,
}

impl RecipientResolver {
    pub fn new(directory: Arc<dyn RecipientDirectory>) -> Self {
        Self { directory }
    }

    /// Resolution order:
    /// 1. the user's enabled per-channel preference address
    /// 2. for the default email channel, the user's primary email
    /// 3. the `recipient` variable
    pub async fn resolve(
        &self,
        user_id: Option<&str>,
        channel_type: &str,
        variables: &Variables,
    ) -> Result<String> {
        if let Some(user_id) = user_id {
            if let Some(pref) = self.directory.channel_preference(user_id, channel_type).await?
                && pref.enabled
                && !pref.address.trim().is_empty()
            {
                return Ok(pref.address.trim().to_string());
            }

            if channel_type == DEFAULT_EMAIL_CHANNEL
                && let Some(email) = self.directory.primary_email(user_id).await?
                && !email.trim().is_empty()
            {
                return Ok(email.trim().to_string());
            }
        }

        if let Some(recipient) = variables.get_str(RECIPIENT_VARIABLE) {
            return Ok(recipient.trim().to_string());
        }

        debug!(user_id = ?user_id, channel_type, "No recipient resolved");
        Err(DeliveryError::RecipientUnresolved {
            channel_type: channel_type.to_string(),
        }
        .into())
    }
}
