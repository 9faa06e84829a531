//! Database model types.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// Outbox
// ==========================================

/// Delivery state of an outbox message.
///
/// `Pending` rows have not been published yet, `AckPending` rows were
/// published and wait for the broker's confirm, `AckCompleted` rows were
/// confirmed and never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    AckPending,
    AckCompleted,
}

impl OutboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AckPending => "ack_pending",
            Self::AckCompleted => "ack_completed",
        }
    }

    /// Parse a stored state. Unknown values are rejected rather than defaulted,
    /// since defaulting to `Pending` would republish the row.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ack_pending" => Some(Self::AckPending),
            "ack_completed" => Some(Self::AckCompleted),
            _ => None,
        }
    }

    /// Whether the confirmation path allows moving from `self` to `next`.
    pub fn can_advance_to(&self, next: OutboxState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::AckPending) | (Self::AckPending, Self::AckCompleted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::AckCompleted
    }
}

impl fmt::Display for OutboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for OutboxState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OutboxState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        OutboxState::parse(s).ok_or_else(|| {
            FromSqlError::Other(format!("unknown outbox state: {s}").into())
        })
    }
}

/// A row of the `outbox_messages` table.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: i64,
    pub event_type: String,
    /// Opaque event body; this layer never parses it.
    pub payload: Vec<u8>,
    pub sequence_number: u64,
    pub state: OutboxState,
    /// Number of times the row was handed to the broker.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
}

/// New outbox message for insertion. Always stored as `Pending`.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub event_type: String,
    pub payload: Vec<u8>,
    pub sequence_number: u64,
}

/// Row counts per outbox state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
    pub pending: u64,
    pub ack_pending: u64,
    pub ack_completed: u64,
}

impl OutboxCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.ack_pending + self.ack_completed
    }

    /// Rows that still need the dispatcher or the broker.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.ack_pending
    }
}

// ==========================================
// Catalog
// ==========================================

/// Product category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// New category for insertion.
#[derive(Debug, Clone)]
pub struct NewCategory {
    pub name: String,
}

/// Product listed in the inventory.
///
/// Serialized as the body of `product-deleted` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: i64,
    pub category_id: i64,
    pub name: String,
    pub price: f64,
    pub description: Option<String>,
    pub address: String,
    pub created_at: DateTime<Utc>,
}

/// New product for insertion.
#[derive(Debug, Clone)]
pub struct NewProduct {
    pub category_id: i64,
    pub name: String,
    pub price: f64,
    pub description: Option<String>,
    pub address: String,
}

/// Image attached to a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductImage {
    pub id: i64,
    pub product_id: i64,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

/// New product image for insertion.
#[derive(Debug, Clone)]
pub struct NewProductImage {
    pub product_id: i64,
    pub image_url: String,
}
