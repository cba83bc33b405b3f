//! Remote keystore secret service
//!
//! Sends the stored ciphertext to a keystore's decrypt endpoint. The keystore
//! holds the master key; this process only ever sees the decrypted identity key.
//!
//! Required environment variables:
//! - FAUCET_KEYSTORE_URL: base URL of the keystore (e.g., https://keystore.internal)
//! - FAUCET_KEYSTORE_TOKEN: bearer token for this instance

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::SecretService;
use crate::config::env_vars;

/// Attempts per decrypt call before giving up on transport errors
const MAX_ATTEMPTS: u32 = 3;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize)]
struct DecryptRequest<'a> {
    ciphertext: &'a str,
}

#[derive(Debug, Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

fn build_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(2)
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| format!("Failed to build keystore HTTP client: {}", e))
}

pub struct KeystoreSecretService {
    keystore_url: String,
    token: String,
    http_client: reqwest::Client,
}

impl KeystoreSecretService {
    pub fn from_env() -> Result<Self, String> {
        let keystore_url = std::env::var(env_vars::KEYSTORE_URL)
            .map_err(|_| format!("{} not set", env_vars::KEYSTORE_URL))?;
        let token = std::env::var(env_vars::KEYSTORE_TOKEN)
            .map_err(|_| format!("{} not set", env_vars::KEYSTORE_TOKEN))?;
        Ok(Self::new(keystore_url, token, build_client()?))
    }

    pub fn new(keystore_url: String, token: String, http_client: reqwest::Client) -> Self {
        Self {
            keystore_url: keystore_url.trim_end_matches('/').to_string(),
            token,
            http_client,
        }
    }

    async fn decrypt_once(&self, ciphertext: &str) -> Result<String, DecryptAttemptError> {
        let url = format!("{}/api/decrypt", self.keystore_url);
        let response = self
            .http_client
            .post(&url)
            .timeout(Duration::from_secs(30))
            .bearer_auth(&self.token)
            .json(&DecryptRequest { ciphertext })
            .send()
            .await
            .map_err(|e| DecryptAttemptError::Transient(format!("Keystore request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("Keystore error ({}): {}", status, body);
            return Err(if status.is_server_error() {
                DecryptAttemptError::Transient(message)
            } else {
                DecryptAttemptError::Fatal(message)
            });
        }

        let data: DecryptResponse = response
            .json()
            .await
            .map_err(|e| DecryptAttemptError::Fatal(format!("Failed to parse keystore response: {}", e)))?;
        Ok(data.plaintext)
    }
}

enum DecryptAttemptError {
    Transient(String),
    Fatal(String),
}

#[async_trait]
impl SecretService for KeystoreSecretService {
    async fn decrypt(&self, ciphertext: &str) -> Result<String, String> {
        let mut attempt = 1;
        loop {
            match self.decrypt_once(ciphertext).await {
                Ok(plaintext) => return Ok(plaintext),
                Err(DecryptAttemptError::Fatal(e)) => return Err(e),
                Err(DecryptAttemptError::Transient(e)) if attempt >= MAX_ATTEMPTS => return Err(e),
                Err(DecryptAttemptError::Transient(e)) => {
                    log::warn!(
                        "[IDENTITY] Keystore decrypt attempt {}/{} failed: {}",
                        attempt,
                        MAX_ATTEMPTS,
                        e
                    );
                    tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    fn mode_name(&self) -> &'static str {
        "keystore"
    }
}
