//! Periodic retention sweeps for the queue and the history log.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::history::HistoryLog;
use super::policy::PolicyStore;
use super::queue::DeliveryQueue;

/// Configuration for the maintenance scheduler.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between sweeps (default: 1 hour).
    pub interval: Duration,
    /// Run a sweep immediately on start instead of after the first interval.
    pub run_on_start: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            run_on_start: false,
        }
    }
}

/// Counts from one maintenance run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub delivered_deleted: u64,
    pub history_deleted: u64,
}

/// Retention scheduler.
///
/// Retention windows are read from the policy on every run, so a policy
/// reload applies to the next sweep.
pub struct MaintenanceScheduler {
    queue: Arc<DeliveryQueue>,
    history: Arc<HistoryLog>,
    policy: Arc<PolicyStore>,
    config: MaintenanceConfig,
}

impl MaintenanceScheduler {
    /// Create a new maintenance scheduler.
    pub fn new(
        queue: Arc<DeliveryQueue>,
        history: Arc<HistoryLog>,
        policy: Arc<PolicyStore>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            queue,
            history,
            policy,
            config,
        }
    }

    /// Start the maintenance loop; it exits when `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_loop(cancel).await })
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        let start = if self.config.run_on_start {
            tokio::time::Instant::now()
        } else {
            tokio::time::Instant::now() + self.config.interval
        };
        let mut interval = tokio::time::interval_at(start, self.config.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_maintenance().await {
                        tracing::error!("Maintenance error: {}", e);
                    }
                }
            }
        }
        tracing::debug!("Maintenance scheduler stopped");
    }

    /// Run all maintenance tasks once.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, crate::Error> {
        let policy = self.policy.current();
        tracing::debug!("Starting notification maintenance");

        let delivered_deleted = self
            .queue
            .cleanup_delivered(policy.delivered_retention_days)
            .await?;
        let history_deleted = self
            .history
            .cleanup(policy.history_retention_days)
            .await?;

        tracing::debug!(
            delivered_deleted,
            history_deleted,
            "Notification maintenance completed"
        );
        Ok(MaintenanceReport {
            delivered_deleted,
            history_deleted,
        })
    }
}
