//! Dispatcher: the single path from pending rows to the broker.
//!
//! Wakes on every poll tick and whenever the writer commits, then publishes
//! pending rows in ascending sequence order. Each row is marked sent only
//! after the broker accepted it. When the broker is unreachable the cycle
//! stops at the first unsent row and the loop backs off exponentially.

use crate::{OutboxEnvelope, OutboxError, OutboxResult, OutboxStore};
use inventory_broker::{BrokerPublisher, ChannelStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Rows fetched per page.
    pub batch_size: usize,
    /// Interval between polls when nothing wakes the dispatcher.
    pub poll_interval: Duration,
    /// Initial backoff after the broker becomes unavailable.
    pub initial_retry_delay_ms: u64,
    /// Maximum backoff.
    pub max_retry_delay_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 30_000,
        }
    }
}

/// The one dispatcher for a publisher. Do not run two against the same channel.
pub struct Dispatcher {
    store: OutboxStore,
    publisher: Arc<BrokerPublisher>,
    config: DispatcherConfig,
    wake: mpsc::Receiver<()>,
    /// Held from publish until the row is marked sent, so the correlator
    /// never sees a confirm for a row that is still `pending`.
    gate: Arc<Mutex<()>>,
}

impl Dispatcher {
    pub fn new(
        store: OutboxStore,
        publisher: Arc<BrokerPublisher>,
        config: DispatcherConfig,
        wake: mpsc::Receiver<()>,
        gate: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
            wake,
            gate,
        }
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut delay_ms = self.config.initial_retry_delay_ms;

        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Outbox dispatcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
                Some(()) = self.wake.recv() => {}
            }

            match self.dispatch_pending().await {
                Ok(published) => {
                    if published > 0 {
                        debug!(published, "Dispatch cycle complete");
                    }
                    delay_ms = self.config.initial_retry_delay_ms;
                }
                Err(OutboxError::BrokerUnavailable(e)) => {
                    warn!(error = %e, delay_ms, "Broker unavailable, backing off");
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    }
                    delay_ms = next_delay(delay_ms, self.config.max_retry_delay_ms);
                }
                Err(e) => {
                    warn!(error = %e, "Dispatch cycle failed");
                }
            }
        }

        info!("Outbox dispatcher stopped");
    }

    /// Publish every pending row once, in sequence order.
    ///
    /// Returns the number of rows published. Stops at the first broker
    /// failure, leaving that row and everything after it pending.
    pub async fn dispatch_pending(&self) -> OutboxResult<usize> {
        if self.publisher.ensure_channel().await? == ChannelStatus::Fresh {
            // Confirms for rows sent on an earlier channel will never arrive.
            let _gate = self.gate.lock().await;
            self.store.recover_in_flight().await?;
        }

        let mut published = 0;
        let mut page = self.store.find_pending(self.config.batch_size).await?;

        while !page.is_empty() {
            let mut last_sequence = 0;
            for row in &page {
                let body = OutboxEnvelope::from_message(row).to_bytes()?;
                let _gate = self.gate.lock().await;
                let tag = self.publisher.publish(row.sequence_number, &body).await?;
                self.store.mark_sent(row.id).await?;
                debug!(sequence = row.sequence_number, tag, id = row.id, "Outbox message sent");
                last_sequence = row.sequence_number;
                published += 1;
            }
            page = self
                .store
                .find_pending_after(last_sequence, self.config.batch_size)
                .await?;
        }

        Ok(published)
    }
}

fn next_delay(current_ms: u64, max_ms: u64) -> u64 {
    current_ms.saturating_mul(2).min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use inventory_broker::{MemoryBroker, PublisherConfig};
    use inventory_database::{AsyncDatabase, NewOutboxMessage, OutboxState};

    struct Fixture {
        store: OutboxStore,
        broker: MemoryBroker,
        dispatcher: Dispatcher,
    }

    async fn fixture(sequences: &'static [u64], batch_size: usize) -> Fixture {
        let store = OutboxStore::new(AsyncDatabase::open_in_memory().await.unwrap());
        store
            .database()
            .transaction(move |tx| {
                for &sequence_number in sequences {
                    OutboxStore::insert_in(
                        tx,
                        &NewOutboxMessage {
                            event_type: "user-created".into(),
                            payload: sequence_number.to_string().into_bytes(),
                            sequence_number,
                        },
                    )?;
                }
                Ok(())
            })
            .await
            .unwrap();

        let broker = MemoryBroker::new();
        let (publisher, _confirms) =
            BrokerPublisher::new(Arc::new(broker.clone()), PublisherConfig::default(), 1);
        let (_wake_tx, wake) = mpsc::channel(1);
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(publisher),
            DispatcherConfig {
                batch_size,
                ..Default::default()
            },
            wake,
            Arc::new(Mutex::new(())),
        );
        Fixture {
            store,
            broker,
            dispatcher,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = DispatcherConfig::default();
        let mut delay = config.initial_retry_delay_ms;
        let mut seen = vec![delay];
        for _ in 0..8 {
            delay = next_delay(delay, config.max_retry_delay_ms);
            seen.push(delay);
        }
        assert_eq!(&seen[..4], &[500, 1000, 2000, 4000]);
        assert_eq!(*seen.last().unwrap(), 30_000);
    }

    #[tokio::test]
    async fn publishes_across_pages_in_order() {
        let f = fixture(&[2, 1, 5, 3, 4], 2).await;

        assert_eq!(f.dispatcher.dispatch_pending().await.unwrap(), 5);

        let published: Vec<OutboxEnvelope> = f
            .broker
            .deliveries()
            .iter()
            .map(|d| OutboxEnvelope::from_bytes(&d.payload).unwrap())
            .collect();
        let sequences: Vec<u64> = published.iter().map(|e| e.sequence_number).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert!(published.iter().all(|e| e.event_type == "user-created"));
        assert_eq!(published[0].payload, serde_json::json!(1));
        assert_eq!(f.store.counts().await.unwrap().ack_pending, 5);
    }

    #[tokio::test]
    async fn unavailable_broker_leaves_rows_pending() {
        let f = fixture(&[1, 2], 10).await;
        f.broker.set_reachable(false);

        let result = f.dispatcher.dispatch_pending().await;
        assert!(matches!(result, Err(OutboxError::BrokerUnavailable(_))));
        assert_eq!(f.store.counts().await.unwrap().pending, 2);

        f.broker.set_reachable(true);
        assert_eq!(f.dispatcher.dispatch_pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fresh_channel_resends_unconfirmed_rows() {
        let f = fixture(&[1, 2], 10).await;
        f.dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(f.store.counts().await.unwrap().ack_pending, 2);

        // Channel dies before any confirm arrives.
        f.broker.set_reachable(false);
        f.broker.set_reachable(true);

        assert_eq!(f.dispatcher.dispatch_pending().await.unwrap(), 2);
        assert_eq!(f.broker.connections(), 2);
        let row = f.store.get_by_sequence(1).await.unwrap().unwrap();
        assert_eq!(row.state, OutboxState::AckPending);
        assert_eq!(row.attempts, 2);
    }
}
