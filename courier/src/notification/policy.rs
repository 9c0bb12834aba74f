//! Delivery policy: process-wide knobs read from the settings store.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::Result;
use crate::database::repositories::SettingsRepository;

pub const KEY_RETRY_MAX: &str = "notifications.retry_max";
pub const KEY_QUEUE_WORKERS: &str = "notifications.queue_workers";
pub const KEY_BATCH_SIZE: &str = "notifications.batch_size";
pub const KEY_RATE_LIMIT_PER_MIN: &str = "notifications.rate_limit_per_min";
pub const KEY_RETRY_BACKOFF: &str = "notifications.retry_backoff";
pub const KEY_SEND_TIMEOUT_SECS: &str = "notifications.send_timeout_secs";
pub const KEY_DELIVERED_RETENTION_DAYS: &str = "notifications.delivered_retention_days";
pub const KEY_HISTORY_RETENTION_DAYS: &str = "notifications.history_retention_days";

/// Upper bound for any retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// How the delay before the next retry grows with the retry count.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `retry_count * 5` minutes.
    Linear,
    /// `2^retry_count` minutes.
    #[default]
    Exponential,
}

impl BackoffStrategy {
    /// Delay before the retry following failure number `retry_count`
    /// (1-based), capped at [`MAX_RETRY_DELAY`].
    pub fn delay(&self, retry_count: u32) -> Duration {
        let minutes = match self {
            Self::Linear => u64::from(retry_count).saturating_mul(5),
            Self::Exponential => 2u64.checked_pow(retry_count).unwrap_or(u64::MAX),
        };
        Duration::from_secs(minutes.saturating_mul(60)).min(MAX_RETRY_DELAY)
    }
}

/// Snapshot of the delivery knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryPolicy {
    /// Retry budget copied onto each entry at enqueue.
    pub retry_max: u32,
    /// Concurrent in-flight entries. Applied when the worker is built.
    pub queue_workers: usize,
    /// Claim size per tick.
    pub batch_size: usize,
    /// Claims per minute; 0 means unlimited.
    pub rate_limit_per_min: u32,
    pub retry_backoff: BackoffStrategy,
    pub send_timeout: Duration,
    pub delivered_retention_days: u32,
    pub history_retention_days: u32,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            retry_max: 3,
            queue_workers: 4,
            batch_size: 50,
            rate_limit_per_min: 0,
            retry_backoff: BackoffStrategy::Exponential,
            send_timeout: Duration::from_secs(30),
            delivered_retention_days: 30,
            history_retention_days: 90,
        }
    }
}

impl DeliveryPolicy {
    /// Build a policy from a key lookup. Missing keys use the default;
    /// invalid values use the default and log a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            retry_max: parse_knob(&lookup, KEY_RETRY_MAX, defaults.retry_max, |v: &u32| {
                (1..=100).contains(v)
            }),
            queue_workers: parse_knob(
                &lookup,
                KEY_QUEUE_WORKERS,
                defaults.queue_workers,
                |v: &usize| (1..=256).contains(v),
            ),
            batch_size: parse_knob(&lookup, KEY_BATCH_SIZE, defaults.batch_size, |v: &usize| {
                (1..=1000).contains(v)
            }),
            rate_limit_per_min: parse_knob(
                &lookup,
                KEY_RATE_LIMIT_PER_MIN,
                defaults.rate_limit_per_min,
                |_: &u32| true,
            ),
            retry_backoff: parse_knob(
                &lookup,
                KEY_RETRY_BACKOFF,
                defaults.retry_backoff,
                |_: &BackoffStrategy| true,
            ),
            send_timeout: Duration::from_secs(parse_knob(
                &lookup,
                KEY_SEND_TIMEOUT_SECS,
                defaults.send_timeout.as_secs(),
                |v: &u64| (1..=3600).contains(v),
            )),
            delivered_retention_days: parse_knob(
                &lookup,
                KEY_DELIVERED_RETENTION_DAYS,
                defaults.delivered_retention_days,
                |v: &u32| *v >= 1,
            ),
            history_retention_days: parse_knob(
                &lookup,
                KEY_HISTORY_RETENTION_DAYS,
                defaults.history_retention_days,
                |v: &u32| *v >= 1,
            ),
        }
    }

    /// Read every knob from the settings store.
    pub async fn from_settings(settings: &dyn SettingsRepository) -> Result<Self> {
        let values: HashMap<String, String> = settings
            .list()
            .await?
            .into_iter()
            .map(|s| (s.key, s.value))
            .collect();
        Ok(Self::from_lookup(|key| values.get(key).cloned()))
    }

    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        self.retry_backoff.delay(retry_count)
    }
}

fn parse_knob<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> T
where
    T: FromStr + fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };

    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warn!(key, value = %raw, default = %default, "Invalid delivery setting, using default");
            default
        }
    }
}

/// Shared, reloadable delivery policy.
pub struct PolicyStore {
    settings: Arc<dyn SettingsRepository>,
    current: RwLock<DeliveryPolicy>,
}

impl PolicyStore {
    pub fn new(settings: Arc<dyn SettingsRepository>, policy: DeliveryPolicy) -> Self {
        Self {
            settings,
            current: RwLock::new(policy),
        }
    }

    /// Create the store and read the initial policy.
    pub async fn load(settings: Arc<dyn SettingsRepository>) -> Result<Self> {
        let policy = DeliveryPolicy::from_settings(settings.as_ref()).await?;
        info!(?policy, "Delivery policy loaded");
        Ok(Self::new(settings, policy))
    }

    /// Re-read all knobs. `queue_workers` only takes effect for workers
    /// built afterwards.
    pub async fn reload(&self) -> Result<DeliveryPolicy> {
        let policy = DeliveryPolicy::from_settings(self.settings.as_ref()).await?;
        let previous = std::mem::replace(&mut *self.current.write(), policy.clone());
        if previous != policy {
            info!(?policy, "Delivery policy reloaded");
        }
        Ok(policy)
    }

    pub fn current(&self) -> DeliveryPolicy {
        self.current.read().clone()
    }

    pub fn settings(&self) -> &Arc<dyn SettingsRepository> {
        &self.settings
    }
}
