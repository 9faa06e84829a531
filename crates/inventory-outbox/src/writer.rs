//! Transactional writer: domain mutation and outbox row commit together.

use crate::{events, OutboxResult, OutboxStore};
use inventory_broker::BrokerPublisher;
use inventory_database::{
    queries, AsyncDatabase, DatabaseError, DatabaseResult, NewOutboxMessage, OutboxMessage, Product,
};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Result of a committed write.
#[derive(Debug, Clone)]
pub struct Written<T> {
    /// Whatever the mutation returned.
    pub value: T,
    /// The outbox row committed with it.
    pub message: OutboxMessage,
}

/// Writes domain changes and their events in one SQLite transaction.
///
/// The sequence number is reserved inside the transaction closure, which runs
/// on the single database thread, so reservation order equals commit order.
/// A failed transaction leaves a gap in the numbering and nothing else.
#[derive(Clone)]
pub struct TransactionalWriter {
    db: AsyncDatabase,
    publisher: Arc<BrokerPublisher>,
    wake: mpsc::Sender<()>,
}

impl TransactionalWriter {
    pub fn new(db: AsyncDatabase, publisher: Arc<BrokerPublisher>, wake: mpsc::Sender<()>) -> Self {
        Self { db, publisher, wake }
    }

    /// Apply `mutation` and record `(event_type, payload)` atomically.
    pub async fn write<F, T>(&self, event_type: &str, payload: Vec<u8>, mutation: F) -> OutboxResult<Written<T>>
    where
        F: FnOnce(&Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.write_with(event_type, move |conn| {
            let value = mutation(conn)?;
            Ok((value, payload))
        })
        .await
    }

    /// Like [`write`](Self::write), but the payload is produced by the
    /// mutation itself (for events describing rows it just removed).
    pub async fn write_with<F, T>(&self, event_type: &str, mutation: F) -> OutboxResult<Written<T>>
    where
        F: FnOnce(&Connection) -> DatabaseResult<(T, Vec<u8>)> + Send + 'static,
        T: Send + 'static,
    {
        let event_type = event_type.to_string();
        let publisher = self.publisher.clone();

        let written = self
            .db
            .transaction(move |tx| {
                let (value, payload) = mutation(tx)?;
                let sequence_number = publisher.allocate_sequence_number();
                let message = OutboxStore::insert_in(
                    tx,
                    &NewOutboxMessage {
                        event_type,
                        payload,
                        sequence_number,
                    },
                )?;
                Ok(Written { value, message })
            })
            .await?;

        debug!(
            sequence = written.message.sequence_number,
            event_type = %written.message.event_type,
            "Committed outbox message"
        );
        self.nudge();
        Ok(written)
    }

    /// Delete a product with its images and emit `product-deleted`.
    ///
    /// The event body is the deleted product as camelCase JSON.
    pub async fn delete_product(&self, product_id: i64) -> OutboxResult<Written<Product>> {
        let written = self
            .write_with(events::PRODUCT_DELETED, move |conn| {
                let product = queries::get_product(conn, product_id)?
                    .ok_or_else(|| DatabaseError::NotFound(format!("product {product_id}")))?;

                let images = queries::delete_product_images(conn, product_id)?;
                queries::delete_product(conn, product_id)?;

                let payload = serde_json::to_vec(&product)
                    .map_err(|e| DatabaseError::InvalidData(e.to_string()))?;
                debug!(product_id, images, "Deleted product rows");
                Ok((product, payload))
            })
            .await?;

        info!(
            product_id,
            sequence = written.message.sequence_number,
            "Product deleted"
        );
        Ok(written)
    }

    fn nudge(&self) {
        // A full channel already holds a wake-up.
        let _ = self.wake.try_send(());
    }
}
