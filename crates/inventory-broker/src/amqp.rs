//! AMQP 0-9-1 broker (RabbitMQ) through `lapin`.
//!
//! Every connect opens a fresh connection and one channel, switches it to
//! confirm mode and declares the destination queue as durable. Messages go to
//! the default exchange with the queue name as routing key and are marked
//! persistent.
//!
//! `lapin` resolves each publisher confirm on its own future, so confirms are
//! forwarded one delivery tag at a time (`multiple = false`).

use crate::{
    BrokerChannel, BrokerConfirm, BrokerConnector, BrokerError, BrokerResult, ChannelHandle,
    ConfirmKind,
};
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::publisher_confirm::Confirmation as LapinConfirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PERSISTENT: u8 = 2;

fn unavailable(err: lapin::Error) -> BrokerError {
    BrokerError::Unavailable(err.to_string())
}

/// Connects to an `amqp://` or `amqps://` URI.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
    queue: String,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> BrokerResult<ChannelHandle> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(unavailable)?;
        let channel = connection.create_channel().await.map_err(unavailable)?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(unavailable)?;
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;

        info!(queue = %self.queue, channel_id = channel.id(), "AMQP channel open in confirm mode");

        let (confirms_tx, confirms_rx) = mpsc::unbounded_channel();
        Ok(ChannelHandle {
            channel: Box::new(AmqpChannel {
                connection: Some(connection),
                channel,
                next_tag: 1,
                confirms: confirms_tx,
            }),
            confirms: confirms_rx,
        })
    }
}

struct AmqpChannel {
    connection: Option<Connection>,
    channel: Channel,
    next_tag: u64,
    confirms: mpsc::UnboundedSender<BrokerConfirm>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn next_delivery_tag(&self) -> u64 {
        self.next_tag
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
            && self
                .connection
                .as_ref()
                .is_some_and(|connection| connection.status().connected())
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> BrokerResult<u64> {
        let pending = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(unavailable)?;

        let delivery_tag = self.next_tag;
        self.next_tag += 1;

        let confirms = self.confirms.clone();
        tokio::spawn(async move {
            let kind = match pending.await {
                Ok(LapinConfirmation::Ack(_)) => ConfirmKind::Ack,
                Ok(LapinConfirmation::Nack(_)) => ConfirmKind::Nack,
                Ok(LapinConfirmation::NotRequested) => {
                    warn!(delivery_tag, "Channel not in confirm mode, treating publish as nacked");
                    ConfirmKind::Nack
                }
                Err(e) => {
                    // Lost with the channel; the row is resent after reconnect.
                    debug!(delivery_tag, error = %e, "Publisher confirm lost");
                    return;
                }
            };
            let _ = confirms.send(BrokerConfirm {
                delivery_tag,
                multiple: false,
                kind,
            });
        });

        Ok(delivery_tag)
    }
}

impl Drop for AmqpChannel {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = connection.close(200, "channel dropped").await {
                    debug!(error = %e, "AMQP connection close failed");
                }
            });
        }
    }
}
