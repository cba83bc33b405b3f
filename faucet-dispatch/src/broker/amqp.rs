//! AMQP 0-9-1 transport (RabbitMQ) built on lapin.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

use super::{BrokerChannel, BrokerError, BrokerSession, Connector, DeliveryStream, QueuedMessage};
use crate::config::QueueTopology;

/// AMQP delivery mode for messages that survive a broker restart
const PERSISTENT_DELIVERY_MODE: u8 = 2;

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

type LostSignal = Arc<Mutex<Option<oneshot::Sender<String>>>>;

pub struct AmqpConnector {
    uri: String,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn open(&self, topology: &QueueTopology) -> Result<BrokerSession, BrokerError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let (lost_tx, lost_rx) = oneshot::channel();
        let lost: LostSignal = Arc::new(Mutex::new(Some(lost_tx)));
        let on_error_signal = lost.clone();
        connection.on_error(move |err| {
            log::error!("[BROKER] Connection error: {}", err);
            signal_lost(&on_error_signal, err.to_string());
        });

        let channel = match declare_topology(&connection, topology).await {
            Ok(channel) => channel,
            Err(e) => {
                // Partially established; the supervisor retries from scratch
                if let Err(close_err) = connection.close(0, "topology setup failed").await {
                    log::warn!("[BROKER] Error closing failed connection: {}", close_err);
                }
                return Err(e);
            }
        };

        Ok(BrokerSession {
            channel: Arc::new(AmqpChannel {
                connection,
                channel,
                lost,
            }),
            lost: lost_rx,
        })
    }

    fn name(&self) -> &'static str {
        "amqp"
    }
}

async fn declare_topology(
    connection: &Connection,
    topology: &QueueTopology,
) -> Result<Channel, BrokerError> {
    let channel = connection.create_channel().await.map_err(channel_error)?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(channel_error)?;

    let durable_exchange = ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    };

    channel
        .exchange_declare(
            &topology.dead_letter_exchange,
            ExchangeKind::Direct,
            durable_exchange,
            FieldTable::default(),
        )
        .await
        .map_err(channel_error)?;

    channel
        .queue_declare(&topology.dead_letter_queue, durable_queue(), FieldTable::default())
        .await
        .map_err(channel_error)?;

    channel
        .queue_bind(
            &topology.dead_letter_queue,
            &topology.dead_letter_exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(channel_error)?;

    let mut arguments = FieldTable::default();
    arguments.insert(
        DEAD_LETTER_EXCHANGE_ARG.into(),
        AMQPValue::LongString(topology.dead_letter_exchange.as_str().into()),
    );
    channel
        .queue_declare(&topology.queue, durable_queue(), arguments)
        .await
        .map_err(channel_error)?;

    Ok(channel)
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

fn channel_error(e: lapin::Error) -> BrokerError {
    BrokerError::Channel(e.to_string())
}

fn signal_lost(lost: &LostSignal, reason: String) {
    if let Some(tx) = lost.lock().take() {
        let _ = tx.send(reason);
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    lost: LostSignal,
}

impl AmqpChannel {
    /// Map an operation error and, if the channel died with it, report the
    /// session as lost so the manager reconnects.
    fn fail(&self, e: lapin::Error) -> BrokerError {
        if !self.channel.status().connected() {
            signal_lost(&self.lost, format!("channel closed: {}", e));
        }
        channel_error(e)
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn publish_persistent(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY_MODE),
            )
            .await
            .map_err(|e| self.fail(e))?;

        let confirmation = confirm.await.map_err(|e| self.fail(e))?;
        if confirmation.is_nack() {
            return Err(BrokerError::PublishNacked);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| self.fail(e))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.fail(e))?;

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(|d| QueuedMessage {
                    delivery_tag: d.delivery_tag,
                    redelivered: d.redelivered,
                    body: d.data,
                })
                .map_err(channel_error)
        });
        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| self.fail(e))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        self.channel
            .basic_nack(delivery_tag, options)
            .await
            .map_err(|e| self.fail(e))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}
