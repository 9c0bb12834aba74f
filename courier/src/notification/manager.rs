//! Channel manager: live channel state, health counters and implementations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::catalog::{ChannelCatalog, ChannelCategory, ChannelDefinition};
use super::channels::{ChannelConfig, NotificationChannel};
use super::policy::PolicyStore;
use super::registry::ChannelRegistry;
use crate::database::models::{ChannelStateDbModel, ChannelStatus};
use crate::database::repositories::ChannelStateRepository;
use crate::database::time::ms_to_datetime;
use crate::{DeliveryError, Error, Result};

/// Consecutive failures that trip a channel into `failed`.
pub const FAILURE_THRESHOLD: i64 = 5;

/// Health snapshot of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel_type: String,
    pub enabled: bool,
    pub state: ChannelStatus,
    pub failure_count: i64,
    pub last_test_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&ChannelStateDbModel> for ChannelStats {
    fn from(row: &ChannelStateDbModel) -> Self {
        Self {
            channel_type: row.channel_type.clone(),
            enabled: row.enabled,
            state: row.status().unwrap_or(ChannelStatus::Disabled),
            failure_count: row.failure_count,
            last_test_at: row.last_test_at.map(ms_to_datetime),
            last_success_at: row.last_success_at.map(ms_to_datetime),
            last_error: row.last_error.clone(),
        }
    }
}

/// A catalog definition joined with its live state.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelOverview {
    pub definition: ChannelDefinition,
    /// `None` until `initialize_channels` has run.
    pub stats: Option<ChannelStats>,
    /// Whether an implementation is registered.
    pub registered: bool,
}

/// Channel manager.
pub struct ChannelManager {
    repo: Arc<dyn ChannelStateRepository>,
    registry: Arc<ChannelRegistry>,
    catalog: Arc<ChannelCatalog>,
    policy: Arc<PolicyStore>,
}

impl ChannelManager {
    pub fn new(
        repo: Arc<dyn ChannelStateRepository>,
        registry: Arc<ChannelRegistry>,
        catalog: Arc<ChannelCatalog>,
        policy: Arc<PolicyStore>,
    ) -> Self {
        Self {
            repo,
            registry,
            catalog,
            policy,
        }
    }

    pub fn catalog(&self) -> &ChannelCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Insert a disabled state row for every catalog definition that has
    /// none. Returns the number of rows created.
    pub async fn initialize_channels(&self) -> Result<usize> {
        let mut created = 0;
        for def in self.catalog.definitions() {
            let row = ChannelStateDbModel::new(def.channel_type, def.display_name);
            if self.repo.insert_if_missing(&row).await? {
                created += 1;
            }
        }
        if created > 0 {
            info!(created, "Initialized channel state rows");
        }
        Ok(created)
    }

    pub fn register_implementation(&self, channel: Arc<dyn NotificationChannel>) {
        if self.catalog.get(channel.channel_type()).is_none() {
            warn!(
                channel_type = %channel.channel_type(),
                "Registering implementation for a type missing from the catalog"
            );
        }
        self.registry.register(channel);
    }

    pub fn get_implementation(
        &self,
        channel_type: &str,
    ) -> std::result::Result<Arc<dyn NotificationChannel>, DeliveryError> {
        self.registry.get(channel_type)
    }

    /// Build and register implementations from persisted configurations.
    /// Rows whose config does not parse are skipped.
    pub async fn load_implementations(&self) -> Result<usize> {
        let mut loaded = 0;
        for row in self.repo.list_states().await? {
            match build_from_row(&row) {
                Ok(Some(channel)) => {
                    self.registry.register(channel);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(
                    channel_type = %row.channel_type,
                    error = %e,
                    "Skipping channel with invalid stored configuration"
                ),
            }
        }
        info!(loaded, "Channel implementations loaded");
        Ok(loaded)
    }

    /// Validate, persist and apply a new configuration. Returns the
    /// normalized configuration that was stored.
    pub async fn configure(&self, channel_type: &str, config: &Value) -> Result<Value> {
        let normalized = self.catalog.validate_config(channel_type, config)?;

        let channel = match ChannelConfig::from_settings(channel_type, &normalized)? {
            Some(typed) => {
                let channel = typed.build_channel()?;
                channel.validate_config(&normalized)?;
                Some(channel)
            }
            None => None,
        };

        self.repo
            .update_config(channel_type, &normalized.to_string())
            .await?;

        if let Some(channel) = channel {
            self.registry.register(channel);
        }
        info!(channel_type, "Channel configuration updated");
        Ok(normalized)
    }

    pub async fn enable(&self, channel_type: &str) -> Result<()> {
        self.repo.set_enabled(channel_type, true).await?;
        info!(channel_type, "Channel enabled");
        Ok(())
    }

    pub async fn disable(&self, channel_type: &str) -> Result<()> {
        self.repo.set_enabled(channel_type, false).await?;
        info!(channel_type, "Channel disabled");
        Ok(())
    }

    /// Run the channel's connectivity test and record the outcome.
    ///
    /// State updates are best-effort; the returned value is the test result.
    pub async fn test(&self, channel_type: &str, recipient: &str) -> Result<()> {
        // Unknown types have nothing to test or record.
        self.repo.get_state(channel_type).await?;

        if let Err(e) = self.repo.mark_testing(channel_type).await {
            warn!(channel_type, error = %e, "Failed to mark channel as testing");
        }

        let timeout = self.policy.current().send_timeout;
        let outcome = match self.registry.get(channel_type) {
            Ok(channel) => run_with_timeout(timeout, channel.test(recipient)).await,
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(()) => {
                info!(channel_type, "Channel test succeeded");
                if let Err(e) = self.repo.record_test_success(channel_type).await {
                    warn!(channel_type, error = %e, "Failed to record test success");
                }
            }
            Err(err) => {
                warn!(channel_type, error = %err, "Channel test failed");
                if let Err(e) = self
                    .repo
                    .record_test_failure(channel_type, &err.to_string())
                    .await
                {
                    warn!(channel_type, error = %e, "Failed to record test failure");
                }
            }
        }

        outcome.map_err(Error::from)
    }

    /// Record a successful delivery. Clears a `failed` trip.
    pub async fn record_success(&self, channel_type: &str) -> Result<()> {
        match self.repo.record_success(channel_type).await? {
            Some(_) => Ok(()),
            None => {
                debug!(channel_type, "No state row for delivered channel");
                Ok(())
            }
        }
    }

    /// Record a failed delivery; trips the channel at [`FAILURE_THRESHOLD`].
    pub async fn record_failure(&self, channel_type: &str, message: &str) -> Result<()> {
        let Some(row) = self
            .repo
            .record_failure(channel_type, message, FAILURE_THRESHOLD)
            .await?
        else {
            debug!(channel_type, "No state row for failed channel");
            return Ok(());
        };

        if row.failure_count == FAILURE_THRESHOLD {
            warn!(
                channel_type,
                failure_count = row.failure_count,
                last_error = %message,
                "Channel marked failed after repeated delivery failures"
            );
        }
        Ok(())
    }

    pub async fn stats(&self, channel_type: &str) -> Result<ChannelStats> {
        let row = self.repo.get_state(channel_type).await?;
        Ok(ChannelStats::from(&row))
    }

    /// Every catalog definition with its state and registration.
    pub async fn list_channels(&self) -> Result<Vec<ChannelOverview>> {
        let rows: HashMap<String, ChannelStateDbModel> = self
            .repo
            .list_states()
            .await?
            .into_iter()
            .map(|row| (row.channel_type.clone(), row))
            .collect();

        Ok(self
            .catalog
            .definitions()
            .iter()
            .map(|def| ChannelOverview {
                definition: def.clone(),
                stats: rows.get(def.channel_type).map(ChannelStats::from),
                registered: self.registry.contains(def.channel_type),
            })
            .collect())
    }

    pub fn definitions_by_category(&self) -> Vec<(ChannelCategory, Vec<&ChannelDefinition>)> {
        self.catalog.by_category()
    }

    /// The implementation to dispatch an entry to, provided the channel is
    /// enabled both in its state row and by its own configuration.
    ///
    /// Unknown or disabled channels fail with [`Error::Delivery`]; any other
    /// error comes from the state store.
    pub async fn dispatch_channel(&self, channel_type: &str) -> Result<Arc<dyn NotificationChannel>> {
        let channel = self.registry.get(channel_type)?;

        let enabled = match self.repo.get_state(channel_type).await {
            Ok(row) => row.enabled,
            Err(Error::NotFound { .. }) => false,
            Err(e) => return Err(e),
        };

        if !enabled || !channel.is_enabled() {
            return Err(DeliveryError::ChannelDisabled(channel_type.to_string()).into());
        }
        Ok(channel)
    }
}

fn build_from_row(row: &ChannelStateDbModel) -> Result<Option<Arc<dyn NotificationChannel>>> {
    let config: Value = serde_json::from_str(&row.config)?;
    // Never configured.
    if config.as_object().is_some_and(|obj| obj.is_empty()) {
        return Ok(None);
    }
    match ChannelConfig::from_settings(&row.channel_type, &config)? {
        Some(typed) => Ok(Some(typed.build_channel()?)),
        None => Ok(None),
    }
}

/// Await a channel call, mapping an elapsed timeout to
/// [`DeliveryError::Timeout`].
pub(crate) async fn run_with_timeout<F>(
    timeout: Duration,
    call: F,
) -> std::result::Result<(), DeliveryError>
where
    F: std::future::Future<Output = Result<()>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(DeliveryError::from),
        Err(_) => Err(DeliveryError::Timeout(timeout)),
    }
}
