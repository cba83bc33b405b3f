//! Enqueue gateway: the producer side of the main queue.

use faucet_types::TransferIntent;
use std::sync::Arc;

use crate::broker::{BrokerConnection, BrokerError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("transfer service unavailable")]
    ServiceUnavailable,
    #[error("invalid transfer intent: {0}")]
    InvalidIntent(String),
    #[error("broker rejected the transfer: {0}")]
    Rejected(String),
}

impl From<BrokerError> for EnqueueError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::PublishNacked => EnqueueError::Rejected(e.to_string()),
            BrokerError::NotReady | BrokerError::Connection(_) | BrokerError::Channel(_) => {
                EnqueueError::ServiceUnavailable
            }
        }
    }
}

#[derive(Clone)]
pub struct EnqueueGateway {
    broker: Arc<BrokerConnection>,
}

impl EnqueueGateway {
    pub fn new(broker: Arc<BrokerConnection>) -> Self {
        Self { broker }
    }

    /// Publish `intent` persistently and wait for the broker to confirm it.
    pub async fn enqueue(&self, intent: &TransferIntent) -> Result<(), EnqueueError> {
        intent.validate().map_err(EnqueueError::InvalidIntent)?;
        let body = intent.to_body().map_err(EnqueueError::InvalidIntent)?;

        let channel = self.broker.get_channel().map_err(|_| {
            log::warn!("[GATEWAY] Broker not ready, refusing transfer to {}", intent.to);
            EnqueueError::ServiceUnavailable
        })?;

        channel
            .publish_persistent(&self.broker.topology().queue, &body)
            .await
            .map_err(|e| {
                log::error!("[GATEWAY] Publish failed: {}", e);
                EnqueueError::from(e)
            })?;

        log::debug!("[GATEWAY] Queued {} to {}", intent.amount, intent.to);
        Ok(())
    }

    pub async fn enqueue_transfer(&self, to: &str, amount: f64) -> Result<(), EnqueueError> {
        self.enqueue(&TransferIntent::new(to, amount)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::config::QueueTopology;
    use std::time::Duration;

    fn gateway(broker: &MemoryBroker) -> (EnqueueGateway, Arc<BrokerConnection>) {
        let connection = BrokerConnection::new(
            Arc::new(broker.clone()),
            QueueTopology::default(),
            Duration::from_millis(50),
        );
        (EnqueueGateway::new(connection.clone()), connection)
    }

    #[tokio::test]
    async fn test_unavailable_before_connect() {
        let broker = MemoryBroker::new();
        let (gateway, _) = gateway(&broker);
        assert_eq!(
            gateway.enqueue_transfer("0xabc", 0.1).await,
            Err(EnqueueError::ServiceUnavailable)
        );
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_publishes_json_body() {
        let broker = MemoryBroker::new();
        let (gateway, connection) = gateway(&broker);
        connection.connect();
        connection.wait_ready(Duration::from_secs(1)).await.unwrap();

        gateway.enqueue_transfer("0xabc", 0.05).await.unwrap();

        let bodies = broker.queue_bodies("faucetQueue");
        assert_eq!(bodies.len(), 1);
        let intent = TransferIntent::from_body(&bodies[0]).unwrap();
        assert_eq!(intent, TransferIntent::new("0xabc", 0.05));
    }

    #[tokio::test]
    async fn test_invalid_intent_not_published() {
        let broker = MemoryBroker::new();
        let (gateway, connection) = gateway(&broker);
        connection.connect();
        connection.wait_ready(Duration::from_secs(1)).await.unwrap();

        let err = gateway.enqueue_transfer("0xabc", 0.0).await.unwrap_err();
        assert!(matches!(err, EnqueueError::InvalidIntent(_)));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_while_reconnecting() {
        let broker = MemoryBroker::new();
        let (gateway, connection) = gateway(&broker);
        connection.connect();
        connection.wait_ready(Duration::from_secs(1)).await.unwrap();

        let mut states = connection.subscribe_state();
        broker.sever("outage");
        states
            .wait_for(|s| *s == crate::broker::ConnectionState::Reconnecting)
            .await
            .unwrap();

        assert_eq!(
            gateway.enqueue_transfer("0xabc", 0.1).await,
            Err(EnqueueError::ServiceUnavailable)
        );
    }

    #[test]
    fn test_broker_error_mapping() {
        assert_eq!(
            EnqueueError::from(BrokerError::NotReady),
            EnqueueError::ServiceUnavailable
        );
        assert_eq!(
            EnqueueError::from(BrokerError::Channel("closed".to_string())),
            EnqueueError::ServiceUnavailable
        );
        assert!(matches!(
            EnqueueError::from(BrokerError::PublishNacked),
            EnqueueError::Rejected(_)
        ));
    }
}
