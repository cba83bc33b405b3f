//! Shared types for the faucet dispatch worker and its producers.

use serde::{Deserialize, Serialize};

// =====================================================
// Queue Message Types
// =====================================================

/// A requested transfer, as carried in the body of a queue message.
///
/// Wire format is UTF-8 JSON `{ "to": string, "amount": number }` with no
/// version field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferIntent {
    pub to: String,
    pub amount: f64,
}

impl TransferIntent {
    pub fn new(to: impl Into<String>, amount: f64) -> Self {
        Self {
            to: to.into(),
            amount,
        }
    }

    /// Checks the invariants every enqueued intent must hold.
    pub fn validate(&self) -> Result<(), String> {
        if self.to.trim().is_empty() {
            return Err("'to' must not be empty".to_string());
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(format!("'amount' must be a positive number, got {}", self.amount));
        }
        Ok(())
    }

    pub fn to_body(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(self).map_err(|e| format!("Failed to encode intent: {}", e))
    }

    pub fn from_body(body: &[u8]) -> Result<Self, String> {
        let text = std::str::from_utf8(body).map_err(|e| format!("Body is not UTF-8: {}", e))?;
        serde_json::from_str(text).map_err(|e| format!("Malformed intent: {}", e))
    }
}

// =====================================================
// Record Types
// =====================================================

/// Association between an identity slot and its public address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaucetWallet {
    pub worker_id: i64,
    pub address: String,
    pub updated_at: String,
}

/// Returned to ingress callers once a transfer is committed to the queue.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub success: bool,
    pub message: String,
}

impl EnqueueReceipt {
    pub fn queued() -> Self {
        Self {
            success: true,
            message: "Transfer queued.".to_string(),
        }
    }
}
