//! In-process map of channel type to live implementation.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::channels::NotificationChannel;
use crate::DeliveryError;

/// Registry of channel implementations.
///
/// Constructed once at startup and shared by `Arc`. Lookups are lock-free
/// reads; registration replaces any previous implementation for the type.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<dyn NotificationChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` under its own type key. Returns the replaced
    /// implementation, if any.
    pub fn register(
        &self,
        channel: Arc<dyn NotificationChannel>,
    ) -> Option<Arc<dyn NotificationChannel>> {
        let channel_type = channel.channel_type().to_string();
        debug!(channel_type = %channel_type, "Registering channel implementation");
        self.channels.insert(channel_type, channel)
    }

    pub fn unregister(&self, channel_type: &str) -> Option<Arc<dyn NotificationChannel>> {
        self.channels.remove(channel_type).map(|(_, channel)| channel)
    }

    pub fn get(
        &self,
        channel_type: &str,
    ) -> std::result::Result<Arc<dyn NotificationChannel>, DeliveryError> {
        self.channels
            .get(channel_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DeliveryError::ChannelNotFound(channel_type.to_string()))
    }

    pub fn contains(&self, channel_type: &str) -> bool {
        self.channels.contains_key(channel_type)
    }

    /// Registered type keys, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}
