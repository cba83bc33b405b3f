//! Fund-transfer ingress
//!
//! Validates a transfer request, applies the per-client and per-recipient
//! rate limits and hands the transfer to the enqueue gateway. Rejected
//! requests never reach the queue. Transport-agnostic: an HTTP handler or the
//! operator CLI passes in the client identifier.

use ethers::types::Address;
use ethers::utils::to_checksum;
use faucet_types::EnqueueReceipt;
use std::sync::Arc;
use std::time::Duration;

use crate::gateway::{EnqueueError, EnqueueGateway};
use crate::rate_limit::RateLimitStore;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IngressError {
    #[error("Invalid wallet address.")]
    InvalidAddress,
    #[error("Invalid amount.")]
    InvalidAmount,
    #[error("Amount exceeds the maximum of {max}.")]
    AmountTooLarge { max: f64 },
    #[error("Rate limit exceeded. Try again later.")]
    RateLimited,
    #[error("Transfer service unavailable.")]
    ServiceUnavailable,
    #[error("Transfer could not be queued: {0}")]
    Failed(String),
}

impl From<EnqueueError> for IngressError {
    fn from(e: EnqueueError) -> Self {
        match e {
            EnqueueError::ServiceUnavailable => IngressError::ServiceUnavailable,
            EnqueueError::InvalidIntent(_) => IngressError::InvalidAmount,
            EnqueueError::Rejected(reason) => IngressError::Failed(reason),
        }
    }
}

pub struct FundTransferIngress {
    gateway: EnqueueGateway,
    limits: Arc<dyn RateLimitStore>,
    max_amount: f64,
    ttl: Duration,
}

impl FundTransferIngress {
    pub fn new(
        gateway: EnqueueGateway,
        limits: Arc<dyn RateLimitStore>,
        max_amount: f64,
        ttl: Duration,
    ) -> Self {
        Self {
            gateway,
            limits,
            max_amount,
            ttl,
        }
    }

    pub async fn request_transfer(
        &self,
        client_ip: &str,
        to: &str,
        amount: f64,
    ) -> Result<EnqueueReceipt, IngressError> {
        if !is_valid_address(to) {
            return Err(IngressError::InvalidAddress);
        }
        if !amount.is_finite() || amount <= 0.0 {
            return Err(IngressError::InvalidAmount);
        }
        if amount > self.max_amount {
            return Err(IngressError::AmountTooLarge {
                max: self.max_amount,
            });
        }

        let ip_key = format!("ip:{}", client_ip);
        let wallet_key = format!("wallet:{}", to.to_lowercase());
        if self.is_limited(&ip_key)? || self.is_limited(&wallet_key)? {
            log::info!("[INGRESS] Rate limited {} -> {}", client_ip, to);
            return Err(IngressError::RateLimited);
        }

        self.gateway.enqueue_transfer(to, amount).await?;

        // The transfer is queued either way; a failed write only loosens the limit
        for key in [&ip_key, &wallet_key] {
            if let Err(e) = self.limits.set(key, self.ttl) {
                log::warn!("[INGRESS] Failed to record rate limit {}: {}", key, e);
            }
        }
        log::info!("[INGRESS] Queued {} to {} for {}", amount, to, client_ip);

        Ok(EnqueueReceipt::queued())
    }

    fn is_limited(&self, key: &str) -> Result<bool, IngressError> {
        self.limits.get(key).map_err(|e| {
            log::error!("[INGRESS] Rate limit lookup failed for {}: {}", key, e);
            IngressError::ServiceUnavailable
        })
    }
}

/// `0x` plus 40 hex digits. Mixed-case input must carry a valid EIP-55
/// checksum; all-lowercase and all-uppercase input is accepted as is.
fn is_valid_address(to: &str) -> bool {
    let Some(digits) = to.strip_prefix("0x") else {
        return false;
    };
    if digits.len() != 40 {
        return false;
    }
    let Ok(address) = to.parse::<Address>() else {
        return false;
    };

    let has_upper = digits.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = digits.chars().any(|c| c.is_ascii_lowercase());
    !(has_upper && has_lower) || to_checksum(&address, None) == to
}
