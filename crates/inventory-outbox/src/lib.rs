//! Transactional outbox with publisher confirms.
//!
//! This crate provides:
//! - `OutboxStore`: async CRUD over `outbox_messages`
//! - `TransactionalWriter`: domain mutation plus outbox row in one transaction
//! - `Dispatcher`: the single loop that publishes pending rows in sequence order
//! - `Correlator`: applies broker confirms and nacks to stored rows
//! - `OutboxEnvelope`: the JSON body consumers receive
//! - `OutboxPipeline`: wires the above to one `BrokerPublisher`

mod correlator;
mod dispatcher;
mod envelope;
mod error;
pub mod events;
mod pipeline;
mod store;
mod writer;

pub use correlator::{Correlator, CorrelatorConfig};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use envelope::OutboxEnvelope;
pub use error::{OutboxError, OutboxResult};
pub use pipeline::{OutboxPipeline, PipelineConfig};
pub use store::OutboxStore;
pub use writer::{TransactionalWriter, Written};
