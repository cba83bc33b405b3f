//! Durable Broker Subsystem
//!
//! Wraps the message broker behind two traits so the dispatch side never sees
//! the transport:
//!
//! - [`Connector`] opens a physical connection, declares the queue topology and
//!   hands back a [`BrokerSession`].
//! - [`BrokerChannel`] is the logical channel: publish, prefetch, consume,
//!   ack/reject by delivery tag.
//!
//! ## Topology
//! ```text
//!   publish ──▶ main queue ──(reject, requeue=false)──▶ dead-letter exchange ──▶ dead-letter queue
//! ```
//!
//! [`BrokerConnection`] owns the single session for the process and
//! reconnects when it is lost.

mod amqp;
mod connection;
#[cfg(test)]
pub mod memory;

pub use amqp::AmqpConnector;
pub use connection::{BrokerConnection, ConnectionState};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::config::QueueTopology;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker channel not ready")]
    NotReady,
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker channel error: {0}")]
    Channel(String),
    #[error("broker refused to confirm publish")]
    PublishNacked,
}

/// A message handed to a consumer, owned by the broker until settled.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<QueuedMessage, BrokerError>>;

/// Logical channel on an open broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Publish to `queue` with persistent delivery mode and wait for the
    /// broker to confirm the message is stored.
    async fn publish_persistent(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError>;

    /// Cap on unacknowledged deliveries to this channel's consumers.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject a delivery. `requeue = false` routes it to the dead-letter exchange.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Close the physical connection this channel belongs to.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// An established connection: its channel, plus a receiver that fires once
/// when the connection is lost.
pub struct BrokerSession {
    pub channel: Arc<dyn BrokerChannel>,
    pub lost: oneshot::Receiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, open one channel, and declare the topology on it.
    async fn open(&self, topology: &QueueTopology) -> Result<BrokerSession, BrokerError>;

    fn name(&self) -> &'static str;
}
