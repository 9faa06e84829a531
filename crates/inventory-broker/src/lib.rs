//! Broker side of the inventory event outbox.
//!
//! This crate provides:
//! - `BrokerConnector` / `BrokerChannel`: the seam to a message broker that
//!   supports publisher confirms (per-channel delivery tags starting at 1,
//!   ack/nack with a cumulative flag)
//! - `AmqpConnector`: RabbitMQ (or any AMQP 0-9-1 broker) through `lapin`
//! - `MemoryBroker`: an in-process broker with the same semantics, used by
//!   tests and the CLI demo mode
//! - `BrokerPublisher`: the single owner of the broker channel. It allocates
//!   outbox sequence numbers, serializes publishes, and turns broker confirms
//!   into `Confirmation`s keyed by sequence number
//!
//! # Confirm flow
//!
//! ```text
//! publish(seq) ──▶ channel ──▶ broker
//!      │                          │ ack/nack(tag, multiple)
//!      ▼                          ▼
//!  window[tag] = seq  ◀──  listener task ──▶ Confirmation { seq, multiple, outcome }
//! ```

mod amqp;
mod channel;
mod error;
mod memory;
mod publisher;

pub use amqp::AmqpConnector;
pub use channel::{BrokerChannel, BrokerConfirm, BrokerConnector, ChannelHandle, ConfirmKind};
pub use error::{BrokerError, BrokerResult};
pub use memory::{Delivery, MemoryBroker};
pub use publisher::{
    BrokerPublisher, ChannelStatus, Confirmation, ConfirmationStream, PublisherConfig,
};
