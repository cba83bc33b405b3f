//! Dispatch loop
//!
//! Consumes transfer intents from the main queue and spreads them over the
//! identity pool in strict round-robin order. Assignment happens in the single
//! driver task; each message is then executed in its own task. An identity's
//! submission lock is held for the whole ledger call, so a slow identity that
//! gets lapped by the cursor never has two submissions outstanding.
//!
//! Every delivery ends in exactly one settlement:
//!
//! | outcome                 | settlement                     |
//! |-------------------------|--------------------------------|
//! | `Success`               | ack                            |
//! | `DuplicateSubmission`   | ack                            |
//! | `RetryableFailure`      | reject, requeue                |
//! | `PermanentFailure`      | reject, no requeue (DLQ)       |

use faucet_types::TransferIntent;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::{
    BrokerChannel, BrokerConnection, BrokerError, ConnectionState, DeliveryStream, QueuedMessage,
};
use crate::identity::{IdentityPool, SigningIdentity};
use crate::ledger::{LedgerClient, LedgerError, LedgerErrorKind};

const CONSUMER_TAG: &str = "faucet-dispatch";

/// How long one readiness wait lasts before the loop re-checks shutdown
const READY_POLL: Duration = Duration::from_secs(5);

/// Pause before re-subscribing after a failed subscribe
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success { tx_ref: String },
    RetryableFailure { reason: String },
    PermanentFailure { reason: String },
    DuplicateSubmission,
}

impl DispatchOutcome {
    pub fn from_submission(result: Result<String, LedgerError>) -> Self {
        match result {
            Ok(tx_ref) => DispatchOutcome::Success { tx_ref },
            Err(e) => match e.kind {
                LedgerErrorKind::Conflict => DispatchOutcome::RetryableFailure { reason: e.message },
                LedgerErrorKind::AlreadyKnown => DispatchOutcome::DuplicateSubmission,
                LedgerErrorKind::Rejected => DispatchOutcome::PermanentFailure { reason: e.message },
            },
        }
    }

    pub fn ack_action(&self) -> AckAction {
        match self {
            DispatchOutcome::Success { .. } | DispatchOutcome::DuplicateSubmission => AckAction::Ack,
            DispatchOutcome::RetryableFailure { .. } => AckAction::Requeue,
            DispatchOutcome::PermanentFailure { .. } => AckAction::DeadLetter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    Requeue,
    DeadLetter,
}

struct Slot {
    identity: Arc<SigningIdentity>,
    submission: Arc<Mutex<()>>,
}

pub struct Dispatcher {
    slots: Vec<Slot>,
    ledger: Arc<dyn LedgerClient>,
    broker: Arc<BrokerConnection>,
    cursor: usize,
}

impl Dispatcher {
    pub fn new(
        pool: &IdentityPool,
        ledger: Arc<dyn LedgerClient>,
        broker: Arc<BrokerConnection>,
    ) -> Self {
        let slots = pool
            .iter()
            .map(|identity| Slot {
                identity: identity.clone(),
                submission: Arc::new(Mutex::new(())),
            })
            .collect();
        Self {
            slots,
            ledger,
            broker,
            cursor: 0,
        }
    }

    /// One unacknowledged delivery per loaded identity.
    pub fn prefetch(&self) -> u16 {
        u16::try_from(self.slots.len()).unwrap_or(u16::MAX)
    }

    /// Identity at the cursor, then advance.
    fn assign(&mut self) -> (Arc<SigningIdentity>, Arc<Mutex<()>>) {
        let slot = &self.slots[self.cursor];
        self.cursor = (self.cursor + 1) % self.slots.len();
        (slot.identity.clone(), slot.submission.clone())
    }

    /// Consume until `shutdown` is cancelled or the broker is closed.
    ///
    /// In-flight executions are detached on exit; whatever they fail to settle
    /// is redelivered by the broker.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if self.slots.is_empty() {
            log::error!("[DISPATCH] No identities to dispatch with");
            return;
        }

        log::info!(
            "[DISPATCH] Started with {} identities (prefetch {})",
            self.slots.len(),
            self.prefetch()
        );

        let mut tasks = JoinSet::new();

        'session: loop {
            let ready = tokio::select! {
                _ = shutdown.cancelled() => break,
                ready = self.broker.wait_ready(READY_POLL) => ready,
            };
            let channel = match ready {
                Ok(channel) => channel,
                Err(_) if self.broker.state() == ConnectionState::Closed => break,
                Err(_) => continue,
            };

            let mut deliveries = match self.subscribe(channel.as_ref()).await {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    log::warn!("[DISPATCH] Subscribe failed: {}. Retrying...", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                    }
                }
            };

            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break 'session,
                    next = deliveries.next() => next,
                };

                match next {
                    Some(Ok(message)) => {
                        let (identity, submission) = self.assign();
                        tasks.spawn(execute(
                            identity,
                            submission,
                            self.ledger.clone(),
                            channel.clone(),
                            message,
                        ));
                    }
                    Some(Err(e)) => {
                        log::warn!("[DISPATCH] Delivery error: {}. Re-subscribing...", e);
                        break;
                    }
                    None => {
                        log::warn!("[DISPATCH] Delivery stream ended. Waiting for broker...");
                        break;
                    }
                }

                while let Some(joined) = tasks.try_join_next() {
                    if let Err(e) = joined {
                        log::error!("[DISPATCH] Execution task failed: {}", e);
                    }
                }
            }
        }

        if !tasks.is_empty() {
            log::info!("[DISPATCH] Stopping with {} executions in flight", tasks.len());
        }
        tasks.detach_all();
        log::info!("[DISPATCH] Stopped");
    }

    async fn subscribe(&self, channel: &dyn BrokerChannel) -> Result<DeliveryStream, BrokerError> {
        let queue = &self.broker.topology().queue;
        channel.set_prefetch(self.prefetch()).await?;
        let deliveries = channel.consume(queue, CONSUMER_TAG).await?;
        log::info!("[DISPATCH] Consuming from '{}'", queue);
        Ok(deliveries)
    }
}

async fn execute(
    identity: Arc<SigningIdentity>,
    submission: Arc<Mutex<()>>,
    ledger: Arc<dyn LedgerClient>,
    channel: Arc<dyn BrokerChannel>,
    message: QueuedMessage,
) {
    let outcome = {
        let _held = submission.lock().await;
        process(ledger.as_ref(), &identity, &message).await
    };

    match &outcome {
        DispatchOutcome::Success { tx_ref } => {
            log::info!("[DISPATCH] Identity {} sent {}", identity.id, tx_ref);
        }
        DispatchOutcome::DuplicateSubmission => {
            log::info!(
                "[DISPATCH] Identity {} transfer already known to the ledger",
                identity.id
            );
        }
        DispatchOutcome::RetryableFailure { reason } => {
            if message.redelivered {
                log::warn!(
                    "[DISPATCH] Redelivered message hit a conflict again on identity {}: {}",
                    identity.id,
                    reason
                );
            } else {
                log::info!("[DISPATCH] Identity {} conflict, requeueing: {}", identity.id, reason);
            }
        }
        DispatchOutcome::PermanentFailure { reason } => {
            log::error!("[DISPATCH] Identity {} dead-lettering message: {}", identity.id, reason);
        }
    }

    settle(channel.as_ref(), message.delivery_tag, outcome.ack_action()).await;
}

/// Decode the intent and submit it. Never settles the message.
async fn process(
    ledger: &dyn LedgerClient,
    identity: &SigningIdentity,
    message: &QueuedMessage,
) -> DispatchOutcome {
    let intent = match TransferIntent::from_body(&message.body) {
        Ok(intent) => intent,
        Err(reason) => return DispatchOutcome::PermanentFailure { reason },
    };
    if let Err(reason) = intent.validate() {
        return DispatchOutcome::PermanentFailure { reason };
    }

    log::debug!(
        "[DISPATCH] Identity {} ({}) sending {} to {}",
        identity.id,
        identity.address,
        intent.amount,
        intent.to
    );

    DispatchOutcome::from_submission(ledger.submit(identity, &intent.to, intent.amount).await)
}

async fn settle(channel: &dyn BrokerChannel, delivery_tag: u64, action: AckAction) {
    let result = match action {
        AckAction::Ack => channel.ack(delivery_tag).await,
        AckAction::Requeue => channel.reject(delivery_tag, true).await,
        AckAction::DeadLetter => channel.reject(delivery_tag, false).await,
    };
    if let Err(e) = result {
        // The broker redelivers anything left unsettled on a dead channel
        log::error!("[DISPATCH] Failed to settle delivery {}: {}", delivery_tag, e);
    }
}
