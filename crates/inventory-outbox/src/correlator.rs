//! Applies broker confirmations to outbox rows.

use crate::{OutboxError, OutboxResult, OutboxStore};
use inventory_broker::{ConfirmKind, Confirmation, ConfirmationStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Retry policy for confirmations the store could not apply.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay: Duration::from_millis(50),
            max_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Consumes the publisher's confirmation stream.
///
/// The publisher forgets a delivery tag once its confirm is emitted, so a
/// confirmation is the only record that the broker took the row. Storage
/// failures are therefore retried with capped backoff until they succeed or
/// the pipeline shuts down. A row left `ack_pending` by shutdown is resent
/// on the next start. Other failures are logged and the confirmation dropped.
pub struct Correlator {
    store: OutboxStore,
    /// Shared with the dispatcher, which holds it from publish until the row
    /// is marked sent.
    gate: Arc<Mutex<()>>,
    config: CorrelatorConfig,
}

impl Correlator {
    pub fn new(store: OutboxStore, gate: Arc<Mutex<()>>, config: CorrelatorConfig) -> Self {
        Self { store, gate, config }
    }

    /// Apply confirmations until the stream ends or shutdown is signalled.
    pub async fn run(self, mut confirms: ConfirmationStream, mut shutdown: broadcast::Receiver<()>) {
        info!("Confirmation correlator started");
        loop {
            let confirmation = tokio::select! {
                _ = shutdown.recv() => break,
                maybe = confirms.recv() => match maybe {
                    Some(confirmation) => confirmation,
                    None => break,
                },
            };

            if !self.settle(confirmation, &mut shutdown).await {
                break;
            }
        }
        info!("Confirmation correlator stopped");
    }

    /// Apply `confirmation`, retrying storage failures.
    ///
    /// Returns `false` if shutdown arrived before it could be applied.
    async fn settle(&self, confirmation: Confirmation, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let mut delay = self.config.initial_retry_delay;
        loop {
            match self.apply(confirmation).await {
                Ok(_) => return true,
                Err(OutboxError::Storage(e)) => {
                    warn!(
                        sequence = confirmation.sequence_number,
                        multiple = confirmation.multiple,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to apply broker confirmation, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => {
                            warn!(
                                sequence = confirmation.sequence_number,
                                "Shutdown with unapplied confirmation; row resent on next start"
                            );
                            return false;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(self.config.max_retry_delay);
                }
                Err(e) => {
                    warn!(
                        sequence = confirmation.sequence_number,
                        multiple = confirmation.multiple,
                        error = %e,
                        "Dropping broker confirmation"
                    );
                    return true;
                }
            }
        }
    }

    /// Apply one confirmation. Returns the number of rows changed.
    pub async fn apply(&self, confirmation: Confirmation) -> OutboxResult<usize> {
        let _gate = self.gate.lock().await;
        let sequence = confirmation.sequence_number;

        match confirmation.outcome {
            ConfirmKind::Ack if confirmation.multiple => {
                let count = self.store.complete_up_to(sequence).await?;
                debug!(sequence, count, "Cumulative confirm applied");
                Ok(count)
            }
            ConfirmKind::Ack => {
                let count = self.store.complete_one(sequence).await?;
                if count == 0 {
                    debug!(sequence, "Confirm matched no in-flight row");
                }
                Ok(count)
            }
            ConfirmKind::Nack => {
                warn!(sequence, "Broker nacked outbox message, requeueing");
                self.store.requeue(sequence, "nacked by broker").await
            }
        }
    }
}
