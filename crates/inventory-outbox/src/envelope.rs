//! Wire format of a published outbox row.
//!
//! Consumers receive one JSON object per message:
//!
//! ```json
//! {
//!   "id": 12,
//!   "eventType": "product-deleted",
//!   "sequenceNumber": 12,
//!   "createdAt": "2026-01-05T10:00:00Z",
//!   "payload": { "id": 7, "name": "rake" }
//! }
//! ```
//!
//! A JSON payload is embedded as is; any other payload is carried as a
//! string.

use crate::OutboxResult;
use chrono::{DateTime, Utc};
use inventory_database::OutboxMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEnvelope {
    pub id: i64,
    pub event_type: String,
    pub sequence_number: u64,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
}

impl OutboxEnvelope {
    pub fn from_message(message: &OutboxMessage) -> Self {
        let payload = serde_json::from_slice(&message.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&message.payload).into_owned()));
        Self {
            id: message.id,
            event_type: message.event_type.clone(),
            sequence_number: message.sequence_number,
            created_at: message.created_at,
            payload,
        }
    }

    /// Message body handed to the broker.
    pub fn to_bytes(&self) -> OutboxResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(body: &[u8]) -> OutboxResult<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inventory_database::OutboxState;

    fn message(event_type: &str, payload: &[u8]) -> OutboxMessage {
        OutboxMessage {
            id: 3,
            event_type: event_type.to_string(),
            payload: payload.to_vec(),
            sequence_number: 9,
            state: OutboxState::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            sent_at: None,
            acked_at: None,
        }
    }

    #[test]
    fn json_payload_is_embedded_next_to_event_type() {
        let body = OutboxEnvelope::from_message(&message("user-deleted", br#"{"id":1}"#))
            .to_bytes()
            .unwrap();

        let wire: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(wire["eventType"], "user-deleted");
        assert_eq!(wire["sequenceNumber"], 9);
        assert_eq!(wire["id"], 3);
        assert_eq!(wire["payload"]["id"], 1);
        assert!(wire["createdAt"].is_string());
    }

    #[test]
    fn same_payload_different_events_differ_on_the_wire() {
        let deleted = OutboxEnvelope::from_message(&message("user-deleted", br#"{"id":1}"#));
        let created = OutboxEnvelope::from_message(&message("user-created", br#"{"id":1}"#));

        assert_ne!(deleted.to_bytes().unwrap(), created.to_bytes().unwrap());
        let decoded = OutboxEnvelope::from_bytes(&created.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.event_type, "user-created");
    }

    #[test]
    fn non_json_payload_travels_as_text() {
        let envelope = OutboxEnvelope::from_message(&message("user-created", b"user-4"));
        assert_eq!(envelope.payload, Value::String("user-4".to_string()));
    }
}
