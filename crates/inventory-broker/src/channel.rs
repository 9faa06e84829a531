//! Broker connection seam.

use crate::BrokerResult;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Whether the broker accepted or refused a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmKind {
    Ack,
    Nack,
}

/// Raw publisher confirm as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfirm {
    pub delivery_tag: u64,
    /// Covers every tag up to and including `delivery_tag`.
    pub multiple: bool,
    pub kind: ConfirmKind,
}

/// An open channel in confirm mode plus its confirm stream.
pub struct ChannelHandle {
    pub channel: Box<dyn BrokerChannel>,
    pub confirms: mpsc::UnboundedReceiver<BrokerConfirm>,
}

/// Opens channels to a broker.
///
/// Implementations must return channels already switched to publisher
/// confirm mode.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> BrokerResult<ChannelHandle>;
}

/// A single ordered broker channel.
#[async_trait]
pub trait BrokerChannel: Send {
    /// Delivery tag the broker will assign to the next publish.
    fn next_delivery_tag(&self) -> u64;

    fn is_open(&self) -> bool;

    /// Publish to `queue` and return the delivery tag consumed.
    async fn publish(&mut self, queue: &str, payload: &[u8]) -> BrokerResult<u64>;
}
