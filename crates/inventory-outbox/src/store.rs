//! Outbox store over the SQLite executor.

use crate::OutboxResult;
use inventory_database::{
    queries, AsyncDatabase, DatabaseResult, NewOutboxMessage, OutboxCounts, OutboxMessage,
};
use rusqlite::Connection;
use tracing::{debug, info};

/// Durable outbox rows.
///
/// Cheap to clone; all clones share the database executor.
#[derive(Clone)]
pub struct OutboxStore {
    db: AsyncDatabase,
}

impl OutboxStore {
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &AsyncDatabase {
        &self.db
    }

    /// Insert a `pending` row inside a transaction the caller already holds.
    ///
    /// Fails with `Conflict` if the sequence number is taken.
    pub fn insert_in(conn: &Connection, message: &NewOutboxMessage) -> DatabaseResult<OutboxMessage> {
        queries::insert_outbox_message(conn, message)
    }

    /// Pending rows in ascending sequence order.
    pub async fn find_pending(&self, limit: usize) -> OutboxResult<Vec<OutboxMessage>> {
        self.find_pending_page(None, limit).await
    }

    /// Pending rows with a sequence number above `after`, ascending.
    pub async fn find_pending_after(&self, after: u64, limit: usize) -> OutboxResult<Vec<OutboxMessage>> {
        self.find_pending_page(Some(after), limit).await
    }

    async fn find_pending_page(&self, after: Option<u64>, limit: usize) -> OutboxResult<Vec<OutboxMessage>> {
        let rows = self
            .db
            .call(move |conn| queries::get_pending_outbox_messages(conn, after, limit))
            .await?;
        Ok(rows)
    }

    /// `pending -> ack_pending`.
    pub async fn mark_sent(&self, id: i64) -> OutboxResult<()> {
        self.db
            .call(move |conn| queries::mark_outbox_message_sent(conn, id))
            .await?;
        Ok(())
    }

    /// Complete every `ack_pending` row with a sequence number up to `sequence_number`.
    pub async fn complete_up_to(&self, sequence_number: u64) -> OutboxResult<usize> {
        let count = self
            .db
            .call(move |conn| queries::complete_outbox_messages_up_to(conn, sequence_number))
            .await?;
        debug!(sequence = sequence_number, count, "Completed outbox messages up to sequence");
        Ok(count)
    }

    /// Complete exactly the row with this sequence number.
    pub async fn complete_one(&self, sequence_number: u64) -> OutboxResult<usize> {
        let count = self
            .db
            .call(move |conn| queries::complete_outbox_message(conn, sequence_number))
            .await?;
        debug!(sequence = sequence_number, count, "Completed outbox message");
        Ok(count)
    }

    /// `ack_pending -> pending` for a row the broker refused.
    pub async fn requeue(&self, sequence_number: u64, reason: &str) -> OutboxResult<usize> {
        let reason = reason.to_string();
        let count = self
            .db
            .call(move |conn| queries::requeue_outbox_message(conn, sequence_number, &reason))
            .await?;
        Ok(count)
    }

    /// Return every `ack_pending` row to `pending`.
    pub async fn recover_in_flight(&self) -> OutboxResult<usize> {
        let count = self
            .db
            .call(queries::reset_in_flight_outbox_messages)
            .await?;
        if count > 0 {
            info!(count, "Recovered in-flight outbox messages");
        }
        Ok(count)
    }

    pub async fn max_sequence_number(&self) -> OutboxResult<Option<u64>> {
        Ok(self.db.call(queries::get_max_outbox_sequence).await?)
    }

    pub async fn counts(&self) -> OutboxResult<OutboxCounts> {
        Ok(self.db.call(queries::count_outbox_messages).await?)
    }

    pub async fn get(&self, id: i64) -> OutboxResult<Option<OutboxMessage>> {
        Ok(self
            .db
            .call(move |conn| queries::get_outbox_message(conn, id))
            .await?)
    }

    pub async fn get_by_sequence(&self, sequence_number: u64) -> OutboxResult<Option<OutboxMessage>> {
        Ok(self
            .db
            .call(move |conn| queries::get_outbox_message_by_sequence(conn, sequence_number))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutboxError;
    use inventory_database::OutboxState;

    async fn store_with(sequences: &[u64]) -> OutboxStore {
        let store = OutboxStore::new(AsyncDatabase::open_in_memory().await.unwrap());
        let messages: Vec<NewOutboxMessage> = sequences
            .iter()
            .map(|&sequence_number| NewOutboxMessage {
                event_type: "product-deleted".to_string(),
                payload: format!("{{\"id\":{sequence_number}}}").into_bytes(),
                sequence_number,
            })
            .collect();
        store
            .database()
            .transaction(move |tx| {
                for message in &messages {
                    OutboxStore::insert_in(tx, message)?;
                }
                Ok(())
            })
            .await
            .unwrap();
        store
    }

    async fn send_all(store: &OutboxStore) {
        for row in store.find_pending(100).await.unwrap() {
            store.mark_sent(row.id).await.unwrap();
        }
    }

    async fn state_of(store: &OutboxStore, sequence_number: u64) -> OutboxState {
        store.get_by_sequence(sequence_number).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn find_pending_is_ordered_and_pageable() {
        let store = store_with(&[3, 1, 2, 5]).await;

        let first: Vec<u64> = store
            .find_pending(2)
            .await
            .unwrap()
            .iter()
            .map(|m| m.sequence_number)
            .collect();
        assert_eq!(first, vec![1, 2]);

        let rest: Vec<u64> = store
            .find_pending_after(2, 10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.sequence_number)
            .collect();
        assert_eq!(rest, vec![3, 5]);
    }

    #[tokio::test]
    async fn mark_sent_twice_is_invalid_state() {
        let store = store_with(&[1]).await;
        let row = store.find_pending(1).await.unwrap().remove(0);

        store.mark_sent(row.id).await.unwrap();
        assert!(matches!(store.mark_sent(row.id).await, Err(OutboxError::InvalidState(_))));
        assert!(matches!(store.mark_sent(999).await, Err(OutboxError::NotFound(_))));
    }

    #[tokio::test]
    async fn cumulative_completion_stops_at_sequence() {
        let store = store_with(&[1, 2, 3]).await;
        send_all(&store).await;

        assert_eq!(store.complete_up_to(2).await.unwrap(), 2);
        assert_eq!(state_of(&store, 1).await, OutboxState::AckCompleted);
        assert_eq!(state_of(&store, 2).await, OutboxState::AckCompleted);
        assert_eq!(state_of(&store, 3).await, OutboxState::AckPending);
    }

    #[tokio::test]
    async fn single_completion_leaves_neighbours() {
        let store = store_with(&[4, 5]).await;
        send_all(&store).await;

        assert_eq!(store.complete_one(5).await.unwrap(), 1);
        assert_eq!(state_of(&store, 4).await, OutboxState::AckPending);
        assert_eq!(state_of(&store, 5).await, OutboxState::AckCompleted);
        // Already completed rows are not touched again.
        assert_eq!(store.complete_one(5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_rows_are_never_completed() {
        let store = store_with(&[1, 2]).await;

        assert_eq!(store.complete_up_to(10).await.unwrap(), 0);
        assert_eq!(store.complete_one(1).await.unwrap(), 0);
        assert_eq!(store.counts().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn requeue_and_recover_return_rows_to_pending() {
        let store = store_with(&[1, 2, 3]).await;
        send_all(&store).await;

        assert_eq!(store.requeue(1, "nacked by broker").await.unwrap(), 1);
        let row = store.get_by_sequence(1).await.unwrap().unwrap();
        assert_eq!(row.state, OutboxState::Pending);
        assert_eq!(row.last_error.as_deref(), Some("nacked by broker"));
        assert_eq!(row.attempts, 1);

        store.complete_one(3).await.unwrap();
        assert_eq!(store.recover_in_flight().await.unwrap(), 1);

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.ack_completed, 1);
        assert_eq!(store.max_sequence_number().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn duplicate_sequence_is_conflict() {
        let store = store_with(&[7]).await;
        let result = store
            .database()
            .transaction(|tx| {
                OutboxStore::insert_in(
                    tx,
                    &NewOutboxMessage {
                        event_type: "user-created".to_string(),
                        payload: b"{}".to_vec(),
                        sequence_number: 7,
                    },
                )
            })
            .await;

        let err = OutboxError::from(result.unwrap_err());
        assert!(matches!(err, OutboxError::Conflict(_)));
        assert_eq!(store.counts().await.unwrap().total(), 1);
    }
}
