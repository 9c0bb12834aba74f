//! Notification delivery pipeline.
//!
//! A trigger enqueues a message for one channel type. A periodic tick asks
//! the [`DeliveryWorker`] to claim due entries; each claimed entry is
//! rendered, routed to its channel implementation and its outcome recorded:
//! - the queue row moves to `delivered`, back to `failed` with a scheduled
//!   retry, or to `dead_letter` once the retry budget is spent
//! - one history record is appended per attempt
//! - channel health counters are updated, tripping the channel to `failed`
//!   after repeated failures
//!
//! Delivery is at-least-once: an entry interrupted mid-send is requeued on
//! the next startup and may be sent again.

pub mod catalog;
pub mod channels;
pub mod history;
pub mod maintenance;
pub mod manager;
pub mod message;
pub mod policy;
pub mod queue;
pub mod recipient;
pub mod registry;
pub mod service;
pub mod worker;

pub use catalog::{ChannelCatalog, ChannelCategory, ChannelDefinition, ConfigField, FieldKind};
pub use channels::{ChannelConfig, NotificationChannel};
pub use history::{HistoryLog, HistoryPage, HistoryQuery};
pub use maintenance::{MaintenanceConfig, MaintenanceReport, MaintenanceScheduler};
pub use manager::{ChannelManager, ChannelOverview, ChannelStats, FAILURE_THRESHOLD};
pub use message::{OutboundMessage, Variables, render_template};
pub use policy::{BackoffStrategy, DeliveryPolicy, PolicyStore};
pub use queue::{DeliveryQueue, NewNotification, QueueStats};
pub use recipient::{DEFAULT_EMAIL_CHANNEL, RecipientResolver};
pub use registry::ChannelRegistry;
pub use service::DeliveryPipeline;
pub use worker::{DeliveryEvent, DeliveryWorker, DispatchBatch};
