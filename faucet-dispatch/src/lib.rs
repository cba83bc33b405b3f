//! Faucet dispatch worker
//!
//! Transfer requests pass the ingress checks, are published to a durable
//! queue, and are consumed by a dispatcher that spreads them over a pool of
//! signing identities. Failed executions are requeued or dead-lettered
//! according to the classified ledger error.

pub mod broker;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod gateway;
pub mod identity;
pub mod ingress;
pub mod ledger;
pub mod rate_limit;
pub mod secrets;
pub mod shutdown;
