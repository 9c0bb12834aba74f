//! Durable delivery queue: enqueue, inspection, requeue and retention.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::message::Variables;
use super::policy::PolicyStore;
use crate::Result;
use crate::database::models::{QueueEntryDbModel, QueueState};
use crate::database::repositories::QueueRepository;
use crate::database::time::{now_ms, retention_cutoff_ms};

/// A notification to enqueue.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: Option<String>,
    pub channel_type: String,
    pub template_id: Option<String>,
    pub subject: String,
    pub body: String,
    pub priority: i64,
    pub variables: Variables,
}

impl NewNotification {
    pub fn new(
        channel_type: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            user_id: None,
            channel_type: channel_type.into(),
            template_id: None,
            subject: subject.into(),
            body: body.into(),
            priority: 0,
            variables: Variables::new(),
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }
}

/// Queue counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Every state is present, zero when empty.
    pub by_state: HashMap<QueueState, i64>,
    /// Claimable now.
    pub pending: i64,
    pub dead_letters: i64,
}

/// Delivery queue service.
pub struct DeliveryQueue {
    repo: Arc<dyn QueueRepository>,
    policy: Arc<PolicyStore>,
}

impl DeliveryQueue {
    pub fn new(repo: Arc<dyn QueueRepository>, policy: Arc<PolicyStore>) -> Self {
        Self { repo, policy }
    }

    pub(crate) fn repository(&self) -> &Arc<dyn QueueRepository> {
        &self.repo
    }

    /// Insert a `created` entry and return its id.
    ///
    /// The channel and recipient are not checked here; problems surface
    /// as delivery failures.
    pub async fn enqueue(
        &self,
        user_id: Option<&str>,
        channel_type: &str,
        subject: &str,
        body: &str,
        priority: i64,
        variables: Variables,
    ) -> Result<String> {
        let mut request = NewNotification::new(channel_type, subject, body)
            .priority(priority)
            .variables(variables);
        request.user_id = user_id.map(str::to_string);
        self.submit(request).await
    }

    /// Like [`Self::enqueue`], carrying a template reference.
    pub async fn enqueue_with_template(
        &self,
        template_id: &str,
        user_id: Option<&str>,
        channel_type: &str,
        subject: &str,
        body: &str,
        priority: i64,
        variables: Variables,
    ) -> Result<String> {
        let mut request = NewNotification::new(channel_type, subject, body)
            .template(template_id)
            .priority(priority)
            .variables(variables);
        request.user_id = user_id.map(str::to_string);
        self.submit(request).await
    }

    pub async fn submit(&self, request: NewNotification) -> Result<String> {
        let max_retries = i64::from(self.policy.current().retry_max);

        let mut entry = QueueEntryDbModel::new(
            request.channel_type,
            request.subject,
            request.body,
            request.priority,
            max_retries,
        );
        entry.user_id = request.user_id;
        entry.template_id = request.template_id;
        entry.variables = request.variables.to_json();

        self.repo.insert(&entry).await?;

        debug!(
            entry_id = %entry.id,
            channel_type = %entry.channel_type,
            priority = entry.priority,
            "Notification enqueued"
        );
        Ok(entry.id)
    }

    pub async fn get_entry(&self, id: &str) -> Result<QueueEntryDbModel> {
        self.repo.get(id).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let by_state = self.repo.count_by_state().await?;
        let pending = self.repo.count_pending(now_ms()).await?;
        let dead_letters = by_state.get(&QueueState::DeadLetter).copied().unwrap_or(0);
        Ok(QueueStats {
            by_state,
            pending,
            dead_letters,
        })
    }

    /// Move the given `dead_letter` entries back to `queued` with a fresh
    /// retry budget. Ids in any other state are ignored.
    pub async fn requeue_dead_letters(&self, ids: &[String]) -> Result<u64> {
        let moved = self.repo.requeue_dead_letters(ids, now_ms()).await?;
        if moved > 0 {
            info!(moved, requested = ids.len(), "Requeued dead-letter entries");
        }
        Ok(moved)
    }

    /// Most recently failed dead-letter entries.
    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<QueueEntryDbModel>> {
        self.repo
            .list_by_state(QueueState::DeadLetter, limit.clamp(1, 1000))
            .await
    }

    /// Delete `delivered` entries older than `retention_days`.
    pub async fn cleanup_delivered(&self, retention_days: u32) -> Result<u64> {
        let deleted = self
            .repo
            .cleanup_delivered(retention_cutoff_ms(retention_days))
            .await?;
        if deleted > 0 {
            info!(deleted, retention_days, "Cleaned up delivered entries");
        }
        Ok(deleted)
    }

    /// Return entries left in `sending` by a previous process to `queued`.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let recovered = self.repo.reset_interrupted(now_ms()).await?;
        if recovered > 0 {
            warn!(recovered, "Recovered entries interrupted mid-delivery");
        }
        Ok(recovered)
    }
}
