//! Ledger client boundary
//!
//! Submits native value transfers and classifies failures exactly once, here,
//! into a tagged [`LedgerError`]. Callers never inspect error text.

use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::Signer;
use ethers::types::{Address, TransactionRequest};
use ethers::utils::parse_ether;

use crate::identity::SigningIdentity;

/// Ordering/concurrency conflicts at the ledger: the same transfer can succeed
/// if submitted again later.
const CONFLICT_SIGNATURES: &[&str] = &["nonce", "replacement transaction underpriced"];

/// The ledger already holds this exact transaction.
const DUPLICATE_SIGNATURES: &[&str] = &["already known", "tx already in mempool"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerErrorKind {
    /// Sequence-number contention or a superseded transaction; retryable
    Conflict,
    /// Transaction was already accepted by the ledger
    AlreadyKnown,
    /// Anything else: insufficient funds, invalid recipient, revert, timeout
    Rejected,
}

impl std::fmt::Display for LedgerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerErrorKind::Conflict => write!(f, "conflict"),
            LedgerErrorKind::AlreadyKnown => write!(f, "already_known"),
            LedgerErrorKind::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LedgerError {
    pub kind: LedgerErrorKind,
    pub message: String,
}

impl LedgerError {
    /// Classify a raw client error message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_message(&message),
            message,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: LedgerErrorKind::Rejected,
            message: message.into(),
        }
    }
}

/// Unmatched messages are `Rejected` so unknown failures are never retried
/// forever.
pub fn classify_message(message: &str) -> LedgerErrorKind {
    let lowered = message.to_lowercase();
    if CONFLICT_SIGNATURES.iter().any(|sig| lowered.contains(sig)) {
        LedgerErrorKind::Conflict
    } else if DUPLICATE_SIGNATURES.iter().any(|sig| lowered.contains(sig)) {
        LedgerErrorKind::AlreadyKnown
    } else {
        LedgerErrorKind::Rejected
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Transfer `amount` (whole native units) from `identity` to `to`.
    /// Returns the transaction reference (hash).
    async fn submit(
        &self,
        identity: &SigningIdentity,
        to: &str,
        amount: f64,
    ) -> Result<String, LedgerError>;
}

/// EVM JSON-RPC ledger using ethers.
pub struct EthersLedger {
    provider: Provider<Http>,
    chain_id: u64,
}

impl EthersLedger {
    /// Connect to `rpc_url`. When `chain_id` is not configured it is read from
    /// the node.
    pub async fn connect(rpc_url: &str, chain_id: Option<u64>) -> Result<Self, String> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| format!("Invalid RPC URL '{}': {}", rpc_url, e))?;

        let chain_id = match chain_id {
            Some(id) => id,
            None => provider
                .get_chainid()
                .await
                .map_err(|e| format!("Failed to query chain id: {}", e))?
                .as_u64(),
        };

        log::info!("[LEDGER] Using RPC {} (chain id {})", rpc_url, chain_id);
        Ok(Self { provider, chain_id })
    }
}

#[async_trait]
impl LedgerClient for EthersLedger {
    async fn submit(
        &self,
        identity: &SigningIdentity,
        to: &str,
        amount: f64,
    ) -> Result<String, LedgerError> {
        let recipient: Address = to
            .parse()
            .map_err(|e| LedgerError::rejected(format!("Invalid recipient '{}': {}", to, e)))?;
        let value = parse_ether(amount)
            .map_err(|e| LedgerError::rejected(format!("Invalid amount {}: {}", amount, e)))?;

        let wallet = identity.wallet().clone().with_chain_id(self.chain_id);
        let client = SignerMiddleware::new(self.provider.clone(), wallet);
        let tx = TransactionRequest::new().to(recipient).value(value);

        let pending = client
            .send_transaction(tx, None)
            .await
            .map_err(|e| LedgerError::classify(e.to_string()))?;

        Ok(format!("{:?}", pending.tx_hash()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_signatures() {
        assert_eq!(classify_message("nonce too low"), LedgerErrorKind::Conflict);
        assert_eq!(
            classify_message("(code: -32000, message: Nonce too high, data: None)"),
            LedgerErrorKind::Conflict
        );
        assert_eq!(
            classify_message("replacement transaction underpriced"),
            LedgerErrorKind::Conflict
        );
    }

    #[test]
    fn test_duplicate_signatures() {
        assert_eq!(classify_message("already known"), LedgerErrorKind::AlreadyKnown);
        assert_eq!(
            classify_message("(code: -32000, message: ALREADY KNOWN, data: None)"),
            LedgerErrorKind::AlreadyKnown
        );
        assert_eq!(classify_message("tx already in mempool"), LedgerErrorKind::AlreadyKnown);
    }

    #[test]
    fn test_unmatched_is_rejected() {
        assert_eq!(
            classify_message("insufficient funds for gas * price + value"),
            LedgerErrorKind::Rejected
        );
        assert_eq!(classify_message("execution reverted"), LedgerErrorKind::Rejected);
        assert_eq!(classify_message(""), LedgerErrorKind::Rejected);
    }

    #[test]
    fn test_classification_is_deterministic() {
        for message in ["nonce too low", "already known", "out of gas"] {
            let first = LedgerError::classify(message);
            for _ in 0..10 {
                assert_eq!(LedgerError::classify(message), first);
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_recipient_rejected_before_rpc() {
        let ledger = EthersLedger {
            provider: Provider::<Http>::try_from("http://127.0.0.1:9").unwrap(),
            chain_id: 1,
        };
        let identity = SigningIdentity::from_private_key(
            1,
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        )
        .unwrap();

        let err = ledger.submit(&identity, "0xnope", 0.1).await.unwrap_err();
        assert_eq!(err.kind, LedgerErrorKind::Rejected);
        assert!(err.message.contains("Invalid recipient"));
    }
}
