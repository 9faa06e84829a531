//! Outbox pipeline lifecycle.

use crate::{Correlator, CorrelatorConfig, Dispatcher, DispatcherConfig, OutboxResult, OutboxStore, TransactionalWriter};
use inventory_broker::{BrokerConnector, BrokerPublisher, PublisherConfig};
use inventory_database::AsyncDatabase;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Settings for every pipeline component.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub publisher: PublisherConfig,
    pub dispatcher: DispatcherConfig,
    pub correlator: CorrelatorConfig,
}

/// Running publisher, correlator and dispatcher over one database.
pub struct OutboxPipeline {
    store: OutboxStore,
    writer: TransactionalWriter,
    publisher: Arc<BrokerPublisher>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl OutboxPipeline {
    /// Seed the sequence allocator from the store and spawn the background
    /// tasks. Must be called from within a tokio runtime.
    pub async fn start(
        db: AsyncDatabase,
        connector: Arc<dyn BrokerConnector>,
        config: PipelineConfig,
    ) -> OutboxResult<Self> {
        let store = OutboxStore::new(db.clone());
        let next_sequence = store.max_sequence_number().await?.map_or(1, |max| max + 1);

        let (publisher, confirms) = BrokerPublisher::new(connector, config.publisher, next_sequence);
        let publisher = Arc::new(publisher);

        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = broadcast::channel(1);
        let gate = Arc::new(Mutex::new(()));

        let correlator = Correlator::new(store.clone(), gate.clone(), config.correlator);
        let dispatcher = Dispatcher::new(store.clone(), publisher.clone(), config.dispatcher, wake_rx, gate);

        let tasks = vec![
            tokio::spawn(correlator.run(confirms, shutdown_tx.subscribe())),
            tokio::spawn(dispatcher.run(shutdown_tx.subscribe())),
        ];

        info!(next_sequence, queue = %publisher.queue(), "Outbox pipeline started");

        Ok(Self {
            store,
            writer: TransactionalWriter::new(db, publisher.clone(), wake_tx),
            publisher,
            shutdown_tx,
            tasks,
        })
    }

    pub fn writer(&self) -> &TransactionalWriter {
        &self.writer
    }

    pub fn store(&self) -> &OutboxStore {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<BrokerPublisher> {
        &self.publisher
    }

    /// Wait until no row is `pending` or `ack_pending`.
    ///
    /// Returns `false` if rows are still outstanding after `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> OutboxResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.store.counts().await?.outstanding() == 0 {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop the background tasks and close the broker channel.
    ///
    /// Unfinished rows stay in the store and resume on the next start.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Outbox task ended abnormally");
            }
        }
        self.publisher.close().await;
        info!("Outbox pipeline stopped");
    }
}
