//! In-process broker with publisher-confirm semantics.
//!
//! Each `connect()` opens a new channel whose delivery tags start at 1. Only
//! the most recent channel is live; making the broker unreachable closes it.
//! Confirms are sent either automatically (one single ack per publish) or by
//! hand through [`MemoryBroker::ack`] / [`MemoryBroker::nack`].

use crate::{
    BrokerChannel, BrokerConfirm, BrokerConnector, BrokerError, BrokerResult, ChannelHandle,
    ConfirmKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A message accepted by the memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Connection number, starting at 1.
    pub connection: u64,
    pub delivery_tag: u64,
    pub queue: String,
    pub payload: Vec<u8>,
}

struct LiveChannel {
    connection: u64,
    next_tag: u64,
    confirms: mpsc::UnboundedSender<BrokerConfirm>,
}

struct BrokerState {
    reachable: bool,
    auto_confirm: bool,
    connections: u64,
    live: Option<LiveChannel>,
    deliveries: Vec<Delivery>,
}

/// Shared handle to an in-process broker. Clones see the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Broker that leaves confirms to the caller.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                auto_confirm: false,
                connections: 0,
                live: None,
                deliveries: Vec::new(),
            })),
        }
    }

    /// Broker that acks every publish as soon as it is accepted.
    pub fn auto_confirming() -> Self {
        let broker = Self::new();
        broker.set_auto_confirm(true);
        broker
    }

    pub fn set_auto_confirm(&self, enabled: bool) {
        self.state.lock().auto_confirm = enabled;
    }

    /// Make the broker reachable or not. Going unreachable closes the live
    /// channel, which also ends its confirm stream.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock();
        state.reachable = reachable;
        if !reachable {
            if let Some(live) = state.live.take() {
                debug!(connection = live.connection, "Memory broker dropped channel");
            }
        }
    }

    /// Every message accepted so far, in arrival order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().deliveries.clone()
    }

    /// Number of channels opened so far.
    pub fn connections(&self) -> u64 {
        self.state.lock().connections
    }

    /// Ack `delivery_tag` (and everything before it when `multiple`).
    /// Returns false when there is no live channel.
    pub fn ack(&self, delivery_tag: u64, multiple: bool) -> bool {
        self.confirm(BrokerConfirm {
            delivery_tag,
            multiple,
            kind: ConfirmKind::Ack,
        })
    }

    /// Nack `delivery_tag` (and everything before it when `multiple`).
    pub fn nack(&self, delivery_tag: u64, multiple: bool) -> bool {
        self.confirm(BrokerConfirm {
            delivery_tag,
            multiple,
            kind: ConfirmKind::Nack,
        })
    }

    fn confirm(&self, confirm: BrokerConfirm) -> bool {
        let state = self.state.lock();
        match &state.live {
            Some(live) => live.confirms.send(confirm).is_ok(),
            None => false,
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> BrokerResult<ChannelHandle> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(BrokerError::Unavailable("memory broker is unreachable".to_string()));
        }

        state.connections += 1;
        let connection = state.connections;
        let (tx, rx) = mpsc::unbounded_channel();
        state.live = Some(LiveChannel {
            connection,
            next_tag: 1,
            confirms: tx,
        });
        debug!(connection, "Memory broker opened channel");

        Ok(ChannelHandle {
            channel: Box::new(MemoryChannel {
                broker: self.clone(),
                connection,
                next_tag: 1,
            }),
            confirms: rx,
        })
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    connection: u64,
    next_tag: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn next_delivery_tag(&self) -> u64 {
        self.next_tag
    }

    fn is_open(&self) -> bool {
        let state = self.broker.state.lock();
        state.reachable
            && state
                .live
                .as_ref()
                .is_some_and(|live| live.connection == self.connection)
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> BrokerResult<u64> {
        let mut guard = self.broker.state.lock();
        let state = &mut *guard;
        if !state.reachable {
            return Err(BrokerError::Unavailable("memory broker is unreachable".to_string()));
        }
        let live = match state.live.as_mut() {
            Some(live) if live.connection == self.connection => live,
            _ => return Err(BrokerError::ChannelClosed),
        };

        let delivery_tag = live.next_tag;
        live.next_tag += 1;
        self.next_tag = live.next_tag;

        state.deliveries.push(Delivery {
            connection: self.connection,
            delivery_tag,
            queue: queue.to_string(),
            payload: payload.to_vec(),
        });

        if state.auto_confirm {
            let _ = live.confirms.send(BrokerConfirm {
                delivery_tag,
                multiple: false,
                kind: ConfirmKind::Ack,
            });
        }

        Ok(delivery_tag)
    }
}
