//! Local ECIES secret service
//!
//! Ciphertexts are base64-encoded ECIES (secp256k1) payloads. The master
//! secret key is read from FAUCET_ECIES_SECRET_KEY and never leaves memory.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::SecretService;
use crate::config::env_vars;

pub struct EciesSecretService {
    secret_key: Vec<u8>,
}

impl EciesSecretService {
    /// Requires: FAUCET_ECIES_SECRET_KEY
    pub fn from_env() -> Result<Self, String> {
        let key = std::env::var(env_vars::ECIES_SECRET_KEY)
            .map_err(|_| format!("{} not set", env_vars::ECIES_SECRET_KEY))?;
        Self::from_secret_key_hex(&key)
    }

    pub fn from_secret_key_hex(secret_key: &str) -> Result<Self, String> {
        let key_hex = secret_key.strip_prefix("0x").unwrap_or(secret_key);
        let secret_key = hex::decode(key_hex.trim())
            .map_err(|e| format!("Invalid ECIES secret key hex: {}", e))?;
        ecies::SecretKey::parse_slice(&secret_key)
            .map_err(|e| format!("Invalid ECIES secret key: {:?}", e))?;
        Ok(Self { secret_key })
    }

    /// Encrypt a plaintext for the holder of `public_key_hex` (65-byte
    /// uncompressed or 33-byte compressed secp256k1 key).
    pub fn encrypt_for(public_key_hex: &str, plaintext: &str) -> Result<String, String> {
        let key_hex = public_key_hex.strip_prefix("0x").unwrap_or(public_key_hex);
        let public_key = hex::decode(key_hex.trim())
            .map_err(|e| format!("Invalid ECIES public key hex: {}", e))?;
        let ciphertext = ecies::encrypt(&public_key, plaintext.as_bytes())
            .map_err(|e| format!("ECIES encryption failed: {:?}", e))?;
        Ok(STANDARD.encode(ciphertext))
    }
}

#[async_trait]
impl SecretService for EciesSecretService {
    async fn decrypt(&self, ciphertext: &str) -> Result<String, String> {
        let bytes = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| format!("Ciphertext is not valid base64: {}", e))?;
        let plaintext = ecies::decrypt(&self.secret_key, &bytes)
            .map_err(|e| format!("ECIES decryption failed: {:?}", e))?;
        String::from_utf8(plaintext).map_err(|e| format!("Decrypted secret is not UTF-8: {}", e))
    }

    fn mode_name(&self) -> &'static str {
        "ecies"
    }
}
