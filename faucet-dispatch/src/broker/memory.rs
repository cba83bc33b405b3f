//! In-process broker used by tests.
//!
//! Mirrors the broker behaviour the dispatcher relies on: durable queues that
//! outlive connections, prefetch credit per channel, requeue to the front with
//! the redelivered flag set, dead-letter routing on reject without requeue,
//! and unacked messages returning to their queue when a connection drops.

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::{BrokerChannel, BrokerError, BrokerSession, Connector, DeliveryStream, QueuedMessage};
use crate::config::QueueTopology;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

struct Session {
    id: u64,
    lost: Option<oneshot::Sender<String>>,
    prefetch: usize,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    consumer: Option<(String, mpsc::UnboundedSender<QueuedMessage>)>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    /// queue -> dead-letter queue reached through its dead-letter exchange
    dead_letter_routes: HashMap<String, String>,
    session: Option<Session>,
    next_session_id: u64,
    refuse_connections: usize,
    refused: usize,
    connects: usize,
    published: usize,
    max_unacked: usize,
    /// Sessions still open when a new connection replaced them
    leaked: usize,
}

impl BrokerState {
    /// Push deliveries to the consumer while prefetch credit remains.
    fn pump(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some((queue_name, sender)) = session.consumer.clone() else {
            return;
        };
        let Some(queue) = self.queues.get_mut(&queue_name) else {
            return;
        };

        while session.prefetch == 0 || session.unacked.len() < session.prefetch {
            let Some(message) = queue.pop_front() else {
                break;
            };
            session.next_tag += 1;
            let tag = session.next_tag;
            let delivery = QueuedMessage {
                delivery_tag: tag,
                redelivered: message.redelivered,
                body: message.body.clone(),
            };
            session.unacked.insert(tag, (queue_name.clone(), message));
            self.max_unacked = self.max_unacked.max(session.unacked.len());
            if sender.send(delivery).is_err() {
                // consumer went away; hand the message back
                if let Some((_, message)) = session.unacked.remove(&tag) {
                    queue.push_front(message);
                }
                session.consumer = None;
                break;
            }
        }
    }

    /// Drop the session, returning its unacked messages to their queues.
    fn end_session(&mut self) -> Option<Session> {
        let mut session = self.session.take()?;
        let unacked = std::mem::take(&mut session.unacked);
        for (_, (queue_name, mut message)) in unacked.into_iter().rev() {
            message.redelivered = true;
            self.queues.entry(queue_name).or_default().push_front(message);
        }
        session.consumer = None;
        Some(session)
    }

    fn session_mut(&mut self, id: u64) -> Result<&mut Session, BrokerError> {
        match self.session.as_mut() {
            Some(session) if session.id == id => Ok(session),
            _ => Err(BrokerError::Channel("channel closed".to_string())),
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_next_connections(&self, n: usize) {
        self.state.lock().refuse_connections = n;
    }

    /// Simulate the channel dying while its connection stays open (e.g. a
    /// channel-level protocol error). The session lingers until closed.
    pub fn fail_channel(&self, reason: &str) {
        let lost = self
            .state
            .lock()
            .session
            .as_mut()
            .and_then(|session| session.lost.take());
        if let Some(lost) = lost {
            let _ = lost.send(reason.to_string());
        }
    }

    /// Simulate the broker dropping the connection.
    pub fn sever(&self, reason: &str) {
        let session = self.state.lock().end_session();
        if let Some(mut session) = session {
            if let Some(lost) = session.lost.take() {
                let _ = lost.send(reason.to_string());
            }
        }
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn dead_letter_target(&self, queue: &str) -> Option<String> {
        self.state.lock().dead_letter_routes.get(queue).cloned()
    }

    pub fn queue_len(&self, name: &str) -> usize {
        self.state.lock().queues.get(name).map(|q| q.len()).unwrap_or(0)
    }

    pub fn queue_bodies(&self, name: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(name)
            .map(|q| q.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .session
            .as_ref()
            .map(|s| s.unacked.len())
            .unwrap_or(0)
    }

    /// Highest number of unacked deliveries ever outstanding at once.
    pub fn max_unacked_seen(&self) -> usize {
        self.state.lock().max_unacked
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().session.is_some()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Connections opened while an earlier one was never closed.
    pub fn leaked_sessions(&self) -> usize {
        self.state.lock().leaked
    }

    pub fn refused_count(&self) -> usize {
        self.state.lock().refused
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().published
    }

    /// True once every published message has been settled out of `queue`.
    pub fn is_drained(&self, queue: &str) -> bool {
        self.queue_len(queue) == 0 && self.unacked_count() == 0
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self, topology: &QueueTopology) -> Result<BrokerSession, BrokerError> {
        let mut state = self.state.lock();
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            state.refused += 1;
            return Err(BrokerError::Connection("connection refused".to_string()));
        }

        // A real broker would keep both connections; count the orphan
        if state.end_session().is_some() {
            state.leaked += 1;
        }

        state.queues.entry(topology.queue.clone()).or_default();
        state.queues.entry(topology.dead_letter_queue.clone()).or_default();
        state
            .dead_letter_routes
            .insert(topology.queue.clone(), topology.dead_letter_queue.clone());

        state.next_session_id += 1;
        state.connects += 1;
        let id = state.next_session_id;
        let (lost_tx, lost_rx) = oneshot::channel();
        state.session = Some(Session {
            id,
            lost: Some(lost_tx),
            prefetch: 0,
            next_tag: 0,
            unacked: BTreeMap::new(),
            consumer: None,
        });

        Ok(BrokerSession {
            channel: Arc::new(MemoryChannel {
                session_id: id,
                state: self.state.clone(),
            }),
            lost: lost_rx,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryChannel {
    session_id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish_persistent(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.session_mut(self.session_id)?;
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(BrokerError::Channel(format!("no queue '{}'", queue)));
        };
        target.push_back(StoredMessage {
            body: body.to_vec(),
            redelivered: false,
        });
        state.published += 1;
        state.pump();
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.session_mut(self.session_id)?.prefetch = count as usize;
        state.pump();
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::Channel(format!("no queue '{}'", queue)));
            }
            state.session_mut(self.session_id)?.consumer = Some((queue.to_string(), tx));
            state.pump();
        }
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (Ok(message), rx))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let session = state.session_mut(self.session_id)?;
        session
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::Channel(format!("unknown delivery tag {}", delivery_tag)))?;
        state.pump();
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let session = state.session_mut(self.session_id)?;
        let (queue_name, mut message) = session
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::Channel(format!("unknown delivery tag {}", delivery_tag)))?;

        if requeue {
            message.redelivered = true;
            state.queues.entry(queue_name).or_default().push_front(message);
        } else if let Some(dlq) = state.dead_letter_routes.get(&queue_name).cloned() {
            message.redelivered = false;
            state.queues.entry(dlq).or_default().push_back(message);
        }
        state.pump();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if state.session_mut(self.session_id).is_ok() {
            state.end_session();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(broker: &MemoryBroker) -> BrokerSession {
        broker.open(&QueueTopology::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_prefetch_limits_deliveries() {
        let broker = MemoryBroker::new();
        let session = open(&broker).await;
        for i in 0..5u8 {
            session.channel.publish_persistent("faucetQueue", &[i]).await.unwrap();
        }
        session.channel.set_prefetch(2).await.unwrap();
        let mut stream = session.channel.consume("faucetQueue", "t").await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let _second = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count(), 2);
        assert_eq!(broker.queue_len("faucetQueue"), 3);

        session.channel.ack(first.delivery_tag).await.unwrap();
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(third.body, vec![2]);
        assert_eq!(broker.max_unacked_seen(), 2);
    }

    #[tokio::test]
    async fn test_reject_routes_to_dead_letter_queue() {
        let broker = MemoryBroker::new();
        let session = open(&broker).await;
        session.channel.publish_persistent("faucetQueue", b"bad").await.unwrap();
        let mut stream = session.channel.consume("faucetQueue", "t").await.unwrap();
        let message = stream.next().await.unwrap().unwrap();

        session.channel.reject(message.delivery_tag, false).await.unwrap();
        assert_eq!(broker.queue_bodies("faucet-dlq"), vec![b"bad".to_vec()]);
        assert_eq!(broker.queue_len("faucetQueue"), 0);
    }

    #[tokio::test]
    async fn test_requeue_redelivers_with_flag() {
        let broker = MemoryBroker::new();
        let session = open(&broker).await;
        session.channel.set_prefetch(1).await.unwrap();
        session.channel.publish_persistent("faucetQueue", b"a").await.unwrap();
        session.channel.publish_persistent("faucetQueue", b"b").await.unwrap();
        let mut stream = session.channel.consume("faucetQueue", "t").await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        session.channel.reject(first.delivery_tag, true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.body, b"a".to_vec());
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_sever_returns_unacked_and_invalidates_channel() {
        let broker = MemoryBroker::new();
        let session = open(&broker).await;
        session.channel.publish_persistent("faucetQueue", b"a").await.unwrap();
        let mut stream = session.channel.consume("faucetQueue", "t").await.unwrap();
        let message = stream.next().await.unwrap().unwrap();

        broker.sever("gone");
        assert_eq!(session.lost.await.unwrap(), "gone");
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_len("faucetQueue"), 1);
        assert!(session.channel.ack(message.delivery_tag).await.is_err());

        // Queues survive the connection
        let session = open(&broker).await;
        let mut stream = session.channel.consume("faucetQueue", "t").await.unwrap();
        let message = stream.next().await.unwrap().unwrap();
        assert!(message.redelivered);
    }

    #[tokio::test]
    async fn test_reopen_without_close_counts_a_leak() {
        let broker = MemoryBroker::new();
        let first = open(&broker).await;
        broker.fail_channel("channel error");
        assert_eq!(first.lost.await.unwrap(), "channel error");
        // The connection outlives its failed channel until closed
        assert!(broker.is_connected());

        let _second = open(&broker).await;
        assert_eq!(broker.leaked_sessions(), 1);

        // Closing a replaced channel is harmless
        first.channel.close().await.unwrap();
        assert!(broker.is_connected());
        assert_eq!(broker.leaked_sessions(), 1);
    }
}
