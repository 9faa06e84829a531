//! Single-owner broker publisher with confirm correlation.
//!
//! Outbox rows carry a sequence number reserved at write time. The broker only
//! knows its own per-channel delivery tags. The publisher bridges the two with
//! a confirm window: right before each publish it records `tag -> sequence`,
//! and the listener task translates every broker confirm through that map.
//! Gaps left by rolled-back reservations, reconnects (tags restart at 1) and
//! process restarts therefore never shift a confirm onto the wrong row.

use crate::{BrokerConfirm, BrokerConnector, BrokerError, BrokerResult, ConfirmKind};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Queue every message is published to.
    pub queue: String,
    /// Upper bound for opening a channel.
    pub connect_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue: "service-queue".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Broker verdict for one sequence number or a range of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub sequence_number: u64,
    /// Applies to every in-flight sequence number up to and including
    /// `sequence_number`.
    pub multiple: bool,
    pub outcome: ConfirmKind,
}

impl Confirmation {
    pub fn ack(sequence_number: u64, multiple: bool) -> Self {
        Self {
            sequence_number,
            multiple,
            outcome: ConfirmKind::Ack,
        }
    }

    pub fn nack(sequence_number: u64) -> Self {
        Self {
            sequence_number,
            multiple: false,
            outcome: ConfirmKind::Nack,
        }
    }
}

/// Receiving end of the publisher's confirmations.
pub type ConfirmationStream = mpsc::UnboundedReceiver<Confirmation>;

/// Result of [`BrokerPublisher::ensure_channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The existing channel is still open.
    Reused,
    /// A new channel was opened. Confirms for anything published on earlier
    /// channels will never arrive.
    Fresh,
}

/// In-flight bookkeeping shared by publish calls and the listener task.
#[derive(Debug, Default)]
struct ConfirmWindow {
    generation: u64,
    /// Delivery tag -> sequence number, current channel only.
    in_flight: BTreeMap<u64, u64>,
    /// Sequence numbers that left the window without an ack (nacked, lost
    /// with a channel) and have not been published again yet.
    requeued: BTreeSet<u64>,
}

impl ConfirmWindow {
    fn open_generation(&mut self) -> u64 {
        self.generation += 1;
        let lost = std::mem::take(&mut self.in_flight);
        self.requeued.extend(lost.into_values());
        self.generation
    }

    fn record(&mut self, delivery_tag: u64, sequence_number: u64) {
        self.in_flight.insert(delivery_tag, sequence_number);
        self.requeued.remove(&sequence_number);
    }

    fn forget(&mut self, delivery_tag: u64) {
        if let Some(sequence_number) = self.in_flight.remove(&delivery_tag) {
            self.requeued.insert(sequence_number);
        }
    }

    fn resolve(&mut self, generation: u64, confirm: BrokerConfirm) -> Vec<Confirmation> {
        if generation != self.generation {
            debug!(generation, tag = confirm.delivery_tag, "Ignoring confirm from closed channel");
            return Vec::new();
        }

        let settled: Vec<u64> = if confirm.multiple {
            let rest = self.in_flight.split_off(&(confirm.delivery_tag + 1));
            std::mem::replace(&mut self.in_flight, rest)
                .into_values()
                .collect()
        } else {
            self.in_flight
                .remove(&confirm.delivery_tag)
                .into_iter()
                .collect()
        };

        if settled.is_empty() {
            warn!(tag = confirm.delivery_tag, multiple = confirm.multiple, "Confirm for unknown delivery tag");
            return Vec::new();
        }

        match confirm.kind {
            ConfirmKind::Nack => {
                self.requeued.extend(settled.iter().copied());
                settled.into_iter().map(Confirmation::nack).collect()
            }
            ConfirmKind::Ack if confirm.multiple => {
                let highest = settled.iter().copied().max().unwrap_or_default();
                // A range ack may only be applied as "everything up to N" when
                // no unconfirmed sequence number sits below N.
                let gap_below = self.in_flight.values().any(|&seq| seq < highest)
                    || self.requeued.range(..highest).next().is_some();
                if gap_below {
                    settled.into_iter().map(|seq| Confirmation::ack(seq, false)).collect()
                } else {
                    vec![Confirmation::ack(highest, true)]
                }
            }
            ConfirmKind::Ack => settled
                .into_iter()
                .map(|seq| Confirmation::ack(seq, false))
                .collect(),
        }
    }
}

/// Hands out outbox sequence numbers.
#[derive(Debug)]
struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    fn new(next: u64) -> Self {
        Self {
            next: AtomicU64::new(next.max(1)),
        }
    }

    fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

struct ActiveChannel {
    channel: Box<dyn crate::BrokerChannel>,
    generation: u64,
    listener: JoinHandle<()>,
}

/// The only path to the broker.
///
/// Publishes are serialized behind an async mutex so that dispatch order is
/// exactly the order of `publish` calls. Share it as `Arc<BrokerPublisher>`.
pub struct BrokerPublisher {
    connector: Arc<dyn BrokerConnector>,
    config: PublisherConfig,
    allocator: SequenceAllocator,
    active: tokio::sync::Mutex<Option<ActiveChannel>>,
    window: Arc<Mutex<ConfirmWindow>>,
    confirm_tx: mpsc::UnboundedSender<Confirmation>,
}

impl BrokerPublisher {
    /// Create a publisher whose first allocated sequence number is
    /// `next_sequence`. No connection is made until [`ensure_channel`].
    ///
    /// [`ensure_channel`]: BrokerPublisher::ensure_channel
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        config: PublisherConfig,
        next_sequence: u64,
    ) -> (Self, ConfirmationStream) {
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        let publisher = Self {
            connector,
            config,
            allocator: SequenceAllocator::new(next_sequence),
            active: tokio::sync::Mutex::new(None),
            window: Arc::new(Mutex::new(ConfirmWindow::default())),
            confirm_tx,
        };
        (publisher, confirm_rx)
    }

    /// Reserve the sequence number for the next outbox row.
    ///
    /// Lock-free, so it can run inside a database transaction.
    pub fn allocate_sequence_number(&self) -> u64 {
        self.allocator.allocate()
    }

    /// The number the next call to `allocate_sequence_number` returns.
    pub fn next_sequence_number(&self) -> u64 {
        self.allocator.peek()
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    /// Make sure an open channel exists, connecting if needed.
    ///
    /// Connecting is bounded by `connect_timeout`.
    pub async fn ensure_channel(&self) -> BrokerResult<ChannelStatus> {
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            if current.channel.is_open() {
                return Ok(ChannelStatus::Reused);
            }
        }
        if let Some(stale) = active.take() {
            stale.listener.abort();
            warn!(generation = stale.generation, "Broker channel closed");
        }

        let handle = match tokio::time::timeout(self.config.connect_timeout, self.connector.connect()).await {
            Ok(result) => result?,
            Err(_) => return Err(BrokerError::ConnectTimeout(self.config.connect_timeout)),
        };

        let generation = self.window.lock().open_generation();
        let listener = tokio::spawn(listen_for_confirms(
            handle.confirms,
            self.window.clone(),
            self.confirm_tx.clone(),
            generation,
        ));

        info!(generation, queue = %self.config.queue, "Broker channel open in confirm mode");

        *active = Some(ActiveChannel {
            channel: handle.channel,
            generation,
            listener,
        });
        Ok(ChannelStatus::Fresh)
    }

    /// Publish the payload of outbox row `sequence_number`.
    ///
    /// Never connects: callers run [`ensure_channel`] first so they learn
    /// about fresh channels. A failed publish drops the channel.
    ///
    /// [`ensure_channel`]: BrokerPublisher::ensure_channel
    pub async fn publish(&self, sequence_number: u64, payload: &[u8]) -> BrokerResult<u64> {
        let mut active = self.active.lock().await;

        let current = match active.as_mut() {
            Some(current) if current.channel.is_open() => current,
            _ => return Err(BrokerError::ChannelClosed),
        };

        // Record before sending so a fast confirm always finds its entry.
        let expected_tag = current.channel.next_delivery_tag();
        self.window.lock().record(expected_tag, sequence_number);

        let result = current.channel.publish(&self.config.queue, payload).await;
        match result {
            Ok(tag) => {
                if tag != expected_tag {
                    warn!(expected_tag, tag, sequence = sequence_number, "Broker assigned unexpected delivery tag");
                    let mut window = self.window.lock();
                    window.in_flight.remove(&expected_tag);
                    window.record(tag, sequence_number);
                }
                debug!(sequence = sequence_number, tag, "Published outbox message");
                Ok(tag)
            }
            Err(e) => {
                self.window.lock().forget(expected_tag);
                if let Some(stale) = active.take() {
                    stale.listener.abort();
                }
                warn!(sequence = sequence_number, error = %e, "Publish failed, channel dropped");
                Err(e)
            }
        }
    }

    /// Whether an open channel currently exists.
    pub async fn is_connected(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|current| current.channel.is_open())
    }

    /// Number of published messages still waiting for a confirm.
    pub fn unconfirmed(&self) -> usize {
        self.window.lock().in_flight.len()
    }

    /// Drop the channel and stop its listener.
    pub async fn close(&self) {
        if let Some(current) = self.active.lock().await.take() {
            current.listener.abort();
            info!(generation = current.generation, "Broker channel closed by owner");
        }
    }
}

/// Forward broker confirms for one channel generation.
async fn listen_for_confirms(
    mut confirms: mpsc::UnboundedReceiver<BrokerConfirm>,
    window: Arc<Mutex<ConfirmWindow>>,
    out: mpsc::UnboundedSender<Confirmation>,
    generation: u64,
) {
    while let Some(confirm) = confirms.recv().await {
        let resolved = window.lock().resolve(generation, confirm);
        for confirmation in resolved {
            if out.send(confirmation).is_err() {
                debug!(generation, "Confirmation receiver dropped, listener exiting");
                return;
            }
        }
    }
    debug!(generation, "Broker confirm stream ended");
}
