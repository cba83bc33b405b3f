//! Broker connection manager
//!
//! Owns the process-wide broker session. A single supervisor task performs
//! every connection attempt, so at most one attempt is active at a time.
//! Readiness is published through a watch channel; callers take the channel
//! through [`BrokerConnection::get_channel`] and must treat `NotReady` as
//! "service unavailable".

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BrokerChannel, BrokerError, Connector};
use crate::config::QueueTopology;

/// Lifecycle of the broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet (first attempt pending or in progress)
    Init,
    /// Channel open and topology declared
    Ready,
    /// Connection lost or attempt failed; waiting out the backoff
    Reconnecting,
    /// Explicitly closed; terminal
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Init => write!(f, "init"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

pub struct BrokerConnection {
    connector: Arc<dyn Connector>,
    topology: QueueTopology,
    reconnect_delay: Duration,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    state: watch::Sender<ConnectionState>,
    started: AtomicBool,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerConnection {
    pub fn new(
        connector: Arc<dyn Connector>,
        topology: QueueTopology,
        reconnect_delay: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Init);
        Arc::new(Self {
            connector,
            topology,
            reconnect_delay,
            channel: RwLock::new(None),
            state,
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        })
    }

    /// Start the supervised connection task. Safe to call repeatedly; only the
    /// first call after construction has an effect.
    pub fn connect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.supervise().await });
        *self.supervisor.lock() = Some(handle);
    }

    /// Current channel, or `NotReady` while disconnected.
    pub fn get_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.channel.read().clone().ok_or(BrokerError::NotReady)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Wait up to `timeout` for the session to become ready.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Ready => {
                        if let Ok(channel) = self.get_channel() {
                            return Ok(channel);
                        }
                    }
                    ConnectionState::Closed => return Err(BrokerError::NotReady),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(BrokerError::NotReady);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(BrokerError::NotReady))
    }

    /// Stop reconnecting and close the physical connection.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.shutdown.cancel();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("[BROKER] Supervisor task ended abnormally: {}", e);
            }
        }
        // Under the channel lock so a supervisor that already opened a
        // session either publishes it before this point or sees the cancel.
        let channel = {
            let mut slot = self.channel.write();
            self.state.send_replace(ConnectionState::Closed);
            slot.take()
        };
        match channel {
            Some(channel) => {
                log::info!("[BROKER] Closing connection");
                channel.close().await
            }
            None => Ok(()),
        }
    }

    /// Move to `state` unless already `Closed`, which is terminal.
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state || *current == ConnectionState::Closed {
                return false;
            }
            log::debug!("[BROKER] State {} -> {}", current, state);
            *current = state;
            true
        });
    }

    /// Close a session's channel that is no longer in use.
    async fn discard(&self, channel: Arc<dyn BrokerChannel>) {
        if let Err(e) = channel.close().await {
            log::debug!("[BROKER] Closing stale connection: {}", e);
        }
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            log::info!("[BROKER] Connecting via {}...", self.connector.name());
            let attempt = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                attempt = self.connector.open(&self.topology) => attempt,
            };

            match attempt {
                Ok(session) => {
                    let published = {
                        let mut slot = self.channel.write();
                        if self.shutdown.is_cancelled() {
                            false
                        } else {
                            *slot = Some(session.channel.clone());
                            self.set_state(ConnectionState::Ready);
                            true
                        }
                    };
                    if !published {
                        self.discard(session.channel).await;
                        return;
                    }
                    log::info!(
                        "[BROKER] Connected; queue '{}' ready (dead-letter: '{}')",
                        self.topology.queue,
                        self.topology.dead_letter_queue
                    );

                    let reason = tokio::select! {
                        biased;
                        // close() takes the channel and closes it
                        _ = self.shutdown.cancelled() => return,
                        reason = session.lost => reason.unwrap_or_else(|_| "connection dropped".to_string()),
                    };
                    log::error!(
                        "[BROKER] Connection lost: {}. Reconnecting in {:?}...",
                        reason,
                        self.reconnect_delay
                    );

                    // The channel may have died alone; its connection must not outlive it
                    let stale = self.channel.write().take();
                    self.set_state(ConnectionState::Reconnecting);
                    if let Some(channel) = stale {
                        self.discard(channel).await;
                    }
                }
                Err(e) => {
                    log::error!(
                        "[BROKER] Failed to connect: {}. Retrying in {:?}...",
                        e,
                        self.reconnect_delay
                    );
                    self.set_state(ConnectionState::Reconnecting);
                }
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }
}
