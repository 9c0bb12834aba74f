//! Delivery worker.
//!
//! Each call to [`DeliveryWorker::process_queue`] reserves worker slots,
//! claims at most that many due entries in one conditional update and
//! dispatches every claimed entry on its own task. Outcomes flow back into
//! the queue row, the history log and channel health.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::history::HistoryLog;
use super::manager::{ChannelManager, run_with_timeout};
use super::message::{OutboundMessage, Variables};
use super::policy::PolicyStore;
use super::queue::DeliveryQueue;
use super::recipient::RecipientResolver;
use crate::database::models::{
    HistoryMetadata, HistoryRecordDbModel, HistoryStatus, QueueEntryDbModel,
};
use crate::database::time::{ms_to_datetime, now_ms};
use crate::{DeliveryError, Error, Result};

/// Capacity of the delivery event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Outcome notifications published by the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeliveryEvent {
    Delivered {
        entry_id: String,
        channel_type: String,
    },
    RetryScheduled {
        entry_id: String,
        channel_type: String,
        retry_count: i64,
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    DeadLettered {
        entry_id: String,
        channel_type: String,
        retry_count: i64,
        error: String,
    },
}

impl DeliveryEvent {
    pub fn entry_id(&self) -> &str {
        match self {
            Self::Delivered { entry_id, .. }
            | Self::RetryScheduled { entry_id, .. }
            | Self::DeadLettered { entry_id, .. } => entry_id,
        }
    }
}

/// Fixed one-minute claim budget.
#[derive(Debug)]
struct RateWindow {
    started: Instant,
    used: usize,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            used: 0,
        }
    }

    /// Take up to `wanted` claims from the current window.
    fn reserve(&mut self, wanted: usize, limit_per_min: u32, now: Instant) -> usize {
        if limit_per_min == 0 {
            return wanted;
        }
        if now.duration_since(self.started) >= RATE_WINDOW {
            self.started = now;
            self.used = 0;
        }
        let remaining = (limit_per_min as usize).saturating_sub(self.used);
        let granted = wanted.min(remaining);
        self.used += granted;
        granted
    }

    /// Give back claims that were reserved but not used.
    fn refund(&mut self, unused: usize) {
        self.used = self.used.saturating_sub(unused);
    }
}

/// Handles for the entries dispatched by one `process_queue` call.
///
/// Dropping the batch does not cancel the dispatch tasks.
#[derive(Debug, Default)]
pub struct DispatchBatch {
    entry_ids: Vec<String>,
    handles: Vec<JoinHandle<()>>,
}

impl DispatchBatch {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Ids in dispatch order.
    pub fn entry_ids(&self) -> &[String] {
        &self.entry_ids
    }

    /// Wait until every dispatched entry has been handled.
    pub async fn wait(self) {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Delivery task failed");
            }
        }
    }
}

/// Delivery worker.
pub struct DeliveryWorker {
    queue: Arc<DeliveryQueue>,
    manager: Arc<ChannelManager>,
    history: Arc<HistoryLog>,
    recipients: Arc<RecipientResolver>,
    policy: Arc<PolicyStore>,
    slots: Arc<Semaphore>,
    workers: usize,
    rate: Mutex<RateWindow>,
    events: broadcast::Sender<DeliveryEvent>,
}

impl DeliveryWorker {
    /// Create a worker. The slot count is fixed from the current policy's
    /// `queue_workers`.
    pub fn new(
        queue: Arc<DeliveryQueue>,
        manager: Arc<ChannelManager>,
        history: Arc<HistoryLog>,
        recipients: Arc<RecipientResolver>,
        policy: Arc<PolicyStore>,
    ) -> Self {
        let workers = policy.current().queue_workers.max(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            queue,
            manager,
            history,
            recipients,
            policy,
            slots: Arc::new(Semaphore::new(workers)),
            workers,
            rate: Mutex::new(RateWindow::new()),
            events,
        }
    }

    /// Subscribe to delivery outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Slots not currently held by a dispatch task.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Requeue entries a previous process left in `sending`. Call once at
    /// startup, before the first tick.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        self.queue.recover_interrupted().await
    }

    /// Claim due entries and start dispatching them.
    ///
    /// Returns once every claimed entry has been handed to its own task.
    pub async fn process_queue(self: &Arc<Self>) -> Result<DispatchBatch> {
        let policy = self.policy.current();

        let mut permits: Vec<OwnedSemaphorePermit> = Vec::new();
        while permits.len() < policy.batch_size {
            match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        if permits.is_empty() {
            debug!("All delivery slots busy, skipping claim");
            return Ok(DispatchBatch::default());
        }

        let reserved =
            self.rate
                .lock()
                .reserve(permits.len(), policy.rate_limit_per_min, Instant::now());
        permits.truncate(reserved);
        if permits.is_empty() {
            debug!(
                limit = policy.rate_limit_per_min,
                "Delivery rate limit reached for this minute"
            );
            return Ok(DispatchBatch::default());
        }

        let claimed = match self
            .queue
            .repository()
            .claim_due(reserved as i64, now_ms())
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                self.rate.lock().refund(reserved);
                return Err(e);
            }
        };
        self.rate.lock().refund(reserved - claimed.len());
        permits.truncate(claimed.len());

        if claimed.is_empty() {
            return Ok(DispatchBatch::default());
        }
        debug!(claimed = claimed.len(), "Claimed queue entries");

        let mut batch = DispatchBatch::default();
        for (entry, permit) in claimed.into_iter().zip(permits) {
            batch.entry_ids.push(entry.id.clone());
            let worker = Arc::clone(self);
            batch.handles.push(tokio::spawn(async move {
                let _permit = permit;
                worker.dispatch(entry).await;
            }));
        }
        Ok(batch)
    }

    /// Tick `process_queue` until `cancel` fires, then wait for in-flight
    /// deliveries to finish.
    pub async fn run(self: Arc<Self>, tick: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(workers = self.workers, tick = ?tick, "Delivery worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.process_queue().await {
                        error!(error = %e, "Failed to claim queue entries");
                    }
                }
            }
        }

        // Every slot back means nothing is in flight.
        match self.slots.acquire_many(self.workers as u32).await {
            Ok(_all) => info!("Delivery worker stopped"),
            Err(e) => warn!(error = %e, "Delivery slots closed during shutdown"),
        }
    }

    async fn dispatch(&self, entry: QueueEntryDbModel) {
        let variables = Variables::from_json(&entry.variables);
        let message = OutboundMessage::render(
            &entry.id,
            &entry.subject,
            &entry.body,
            entry.priority,
            variables,
        );

        let outcome = match self.attempt(&entry, &message).await {
            Ok(Ok(())) => self.handle_success(&entry, &message).await,
            Ok(Err(err)) => self.handle_failure(&entry, &message, err).await,
            Err(store_err) => self.release(&entry, store_err).await,
        };

        // The row stays in `sending` until startup recovery.
        if let Err(e) = outcome {
            error!(
                entry_id = %entry.id,
                channel_type = %entry.channel_type,
                error = %e,
                "Failed to record delivery outcome"
            );
        }
    }

    /// The outer error is a store failure, which says nothing about the
    /// entry or its channel.
    async fn attempt(
        &self,
        entry: &QueueEntryDbModel,
        message: &OutboundMessage,
    ) -> Result<std::result::Result<(), DeliveryError>> {
        let channel = match self.manager.dispatch_channel(&entry.channel_type).await {
            Ok(channel) => channel,
            Err(Error::Delivery(err)) => return Ok(Err(err)),
            Err(e) => return Err(e),
        };
        let recipient = match self
            .recipients
            .resolve(
                entry.user_id.as_deref(),
                &entry.channel_type,
                &message.variables,
            )
            .await
        {
            Ok(recipient) => recipient,
            Err(Error::Delivery(err)) => return Ok(Err(err)),
            Err(e) => return Err(e),
        };

        let timeout = self.policy.current().send_timeout;
        Ok(run_with_timeout(timeout, channel.send(&recipient, message)).await)
    }

    /// Put the entry back for the next tick. No retry is spent and the
    /// channel's health is left alone.
    async fn release(&self, entry: &QueueEntryDbModel, store_err: Error) -> Result<()> {
        warn!(
            entry_id = %entry.id,
            channel_type = %entry.channel_type,
            error = %store_err,
            "Store unavailable during dispatch, releasing entry"
        );
        if !self
            .queue
            .repository()
            .release_claim(&entry.id, now_ms())
            .await?
        {
            warn!(entry_id = %entry.id, "Entry left the sending state before it was released");
        }
        Ok(())
    }

    async fn handle_success(
        &self,
        entry: &QueueEntryDbModel,
        message: &OutboundMessage,
    ) -> Result<()> {
        if !self
            .queue
            .repository()
            .mark_delivered(&entry.id, now_ms())
            .await?
        {
            warn!(entry_id = %entry.id, "Entry left the sending state before delivery was recorded");
            return Ok(());
        }

        debug!(
            entry_id = %entry.id,
            channel_type = %entry.channel_type,
            "Notification delivered"
        );

        self.append_history(entry, message, HistoryStatus::Delivered, entry.retry_count, None)
            .await;

        if let Err(e) = self.manager.record_success(&entry.channel_type).await {
            warn!(channel_type = %entry.channel_type, error = %e, "Failed to record channel success");
        }

        let _ = self.events.send(DeliveryEvent::Delivered {
            entry_id: entry.id.clone(),
            channel_type: entry.channel_type.clone(),
        });
        Ok(())
    }

    async fn handle_failure(
        &self,
        entry: &QueueEntryDbModel,
        message: &OutboundMessage,
        err: DeliveryError,
    ) -> Result<()> {
        let retry_count = entry.retry_count + 1;
        let error_text = err.to_string();
        let now = now_ms();
        let repo = self.queue.repository();

        let (status, event) = if retry_count >= entry.max_retries {
            if !repo
                .mark_dead_letter(&entry.id, retry_count, &error_text, now)
                .await?
            {
                warn!(entry_id = %entry.id, "Entry left the sending state before dead-lettering");
                return Ok(());
            }
            warn!(
                entry_id = %entry.id,
                channel_type = %entry.channel_type,
                retry_count,
                error = %error_text,
                "Notification moved to dead letter"
            );
            (
                HistoryStatus::DeadLetter,
                DeliveryEvent::DeadLettered {
                    entry_id: entry.id.clone(),
                    channel_type: entry.channel_type.clone(),
                    retry_count,
                    error: error_text.clone(),
                },
            )
        } else {
            let delay = self
                .policy
                .current()
                .retry_delay(u32::try_from(retry_count).unwrap_or(u32::MAX));
            let next_retry_at = now.saturating_add(delay.as_millis() as i64);
            if !repo
                .mark_retry(&entry.id, retry_count, next_retry_at, &error_text, now)
                .await?
            {
                warn!(entry_id = %entry.id, "Entry left the sending state before retry was scheduled");
                return Ok(());
            }
            info!(
                entry_id = %entry.id,
                channel_type = %entry.channel_type,
                retry_count,
                max_retries = entry.max_retries,
                delay = ?delay,
                error = %error_text,
                "Delivery failed, retry scheduled"
            );
            (
                HistoryStatus::Failed,
                DeliveryEvent::RetryScheduled {
                    entry_id: entry.id.clone(),
                    channel_type: entry.channel_type.clone(),
                    retry_count,
                    next_retry_at: ms_to_datetime(next_retry_at),
                    error: error_text.clone(),
                },
            )
        };

        self.append_history(entry, message, status, retry_count, Some(&err))
            .await;

        if let Err(e) = self
            .manager
            .record_failure(&entry.channel_type, &error_text)
            .await
        {
            warn!(channel_type = %entry.channel_type, error = %e, "Failed to record channel failure");
        }

        let _ = self.events.send(event);
        Ok(())
    }

    async fn append_history(
        &self,
        entry: &QueueEntryDbModel,
        message: &OutboundMessage,
        status: HistoryStatus,
        retry_count: i64,
        err: Option<&DeliveryError>,
    ) {
        let metadata = HistoryMetadata {
            retry_count,
            priority: entry.priority,
            error_kind: err.map(|e| e.kind().to_string()),
        };
        let record = HistoryRecordDbModel::new(
            &entry.id,
            entry.user_id.clone(),
            &entry.channel_type,
            status,
            &message.subject,
            &message.body,
            err.map(ToString::to_string),
            &metadata,
        );
        if let Err(e) = self.history.record(&record).await {
            warn!(entry_id = %entry.id, error = %e, "Failed to append delivery history");
        }
    }
}
