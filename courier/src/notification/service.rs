//! Wiring of the delivery pipeline components over one database pool.

use std::sync::Arc;

use tracing::info;

use super::catalog::ChannelCatalog;
use super::history::HistoryLog;
use super::manager::ChannelManager;
use super::policy::PolicyStore;
use super::queue::DeliveryQueue;
use super::recipient::RecipientResolver;
use super::registry::ChannelRegistry;
use super::worker::DeliveryWorker;
use crate::Result;
use crate::database::DbPool;
use crate::database::repositories::{
    SqlxChannelStateRepository, SqlxHistoryRepository, SqlxQueueRepository,
    SqlxRecipientDirectory, SqlxSettingsRepository,
};

/// All pipeline services, built once at startup.
pub struct DeliveryPipeline {
    pub policy: Arc<PolicyStore>,
    pub manager: Arc<ChannelManager>,
    pub queue: Arc<DeliveryQueue>,
    pub history: Arc<HistoryLog>,
    pub worker: Arc<DeliveryWorker>,
}

impl DeliveryPipeline {
    /// Build the pipeline with the built-in channel catalog.
    pub async fn from_pool(pool: DbPool) -> Result<Self> {
        Self::with_catalog(pool, ChannelCatalog::builtin()).await
    }

    pub async fn with_catalog(pool: DbPool, catalog: ChannelCatalog) -> Result<Self> {
        let settings = Arc::new(SqlxSettingsRepository::new(pool.clone()));
        let policy = Arc::new(PolicyStore::load(settings).await?);

        let manager = Arc::new(ChannelManager::new(
            Arc::new(SqlxChannelStateRepository::new(pool.clone())),
            Arc::new(ChannelRegistry::new()),
            Arc::new(catalog),
            Arc::clone(&policy),
        ));
        let queue = Arc::new(DeliveryQueue::new(
            Arc::new(SqlxQueueRepository::new(pool.clone())),
            Arc::clone(&policy),
        ));
        let history = Arc::new(HistoryLog::new(Arc::new(SqlxHistoryRepository::new(
            pool.clone(),
        ))));
        let recipients = Arc::new(RecipientResolver::new(Arc::new(
            SqlxRecipientDirectory::new(pool),
        )));

        let worker = Arc::new(DeliveryWorker::new(
            Arc::clone(&queue),
            Arc::clone(&manager),
            Arc::clone(&history),
            recipients,
            Arc::clone(&policy),
        ));

        Ok(Self {
            policy,
            manager,
            queue,
            history,
            worker,
        })
    }

    /// Startup sequence: seed channel rows, build configured channels and
    /// recover entries interrupted by a previous shutdown.
    pub async fn start(&self) -> Result<()> {
        self.manager.initialize_channels().await?;
        self.manager.load_implementations().await?;
        self.worker.recover_interrupted().await?;
        info!(
            workers = self.worker.workers(),
            "Delivery pipeline ready"
        );
        Ok(())
    }
}
