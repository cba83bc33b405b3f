//! Secret Service Abstraction
//!
//! Identity keys are stored encrypted; this module turns a stored ciphertext
//! back into key material. Two modes are supported:
//!
//! - **ECIES Mode**: ciphertext decrypted locally with a master key from ENV
//!   (FAUCET_ECIES_SECRET_KEY)
//! - **Keystore Mode**: ciphertext sent to a remote decrypt endpoint
//!
//! The mode is determined by the `FAUCET_SECRET_MODE` environment variable:
//! - `ecies` (default): Use EciesSecretService
//! - `keystore`: Use KeystoreSecretService

mod ecies_service;
mod keystore_service;

pub use ecies_service::EciesSecretService;
pub use keystore_service::KeystoreSecretService;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::env_vars;

/// Trait for secret services - abstracts where decryption happens
#[async_trait]
pub trait SecretService: Send + Sync {
    /// Decrypt a stored (base64) ciphertext into its plaintext
    async fn decrypt(&self, ciphertext: &str) -> Result<String, String>;

    /// Get the mode name for logging
    fn mode_name(&self) -> &'static str;
}

/// Create the secret service selected by FAUCET_SECRET_MODE
pub fn create_secret_service() -> Result<Arc<dyn SecretService>, String> {
    let mode = std::env::var(env_vars::SECRET_MODE)
        .unwrap_or_else(|_| "ecies".to_string())
        .to_lowercase();

    log::info!("Initializing secret service in {} mode", mode);

    match mode.as_str() {
        "ecies" | "local" => Ok(Arc::new(EciesSecretService::from_env()?)),
        "keystore" | "remote" => Ok(Arc::new(KeystoreSecretService::from_env()?)),
        _ => Err(format!(
            "Unknown {} '{}'. Use 'ecies' or 'keystore'.",
            env_vars::SECRET_MODE,
            mode
        )),
    }
}
