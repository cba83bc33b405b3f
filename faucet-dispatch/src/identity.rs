//! Signing identity pool
//!
//! Each identity slot `1..=n` has an encrypted private key in the record
//! store. At startup the key is decrypted through the secret service, the
//! public address is derived and recorded, and the identity joins the pool.
//! Missing or undecryptable slots are skipped; an empty pool is fatal.

use ethers::core::k256::ecdsa::SigningKey;
use ethers::signers::{LocalWallet, Signer};
use std::fmt;
use std::sync::Arc;

use crate::db::Db;
use crate::secrets::SecretService;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no signing identities could be loaded from {slots} slot(s)")]
    NoIdentities { slots: u32 },
}

/// A secret-holding signer. Only the address is ever displayed or logged.
pub struct SigningIdentity {
    pub id: u32,
    pub address: String,
    wallet: LocalWallet,
}

impl SigningIdentity {
    /// Build an identity from a private key string (hex, with or without 0x)
    pub fn from_private_key(id: u32, private_key: &str) -> Result<Self, String> {
        let key_hex = private_key.trim();
        let key_hex = key_hex.strip_prefix("0x").unwrap_or(key_hex);

        let key_bytes = hex::decode(key_hex).map_err(|e| format!("Invalid private key hex: {}", e))?;
        if key_bytes.len() != 32 {
            return Err(format!(
                "Invalid private key length: expected 32 bytes, got {}",
                key_bytes.len()
            ));
        }

        let signing_key = SigningKey::from_bytes(key_bytes.as_slice().into())
            .map_err(|e| format!("Invalid private key: {}", e))?;

        let wallet = LocalWallet::from(signing_key);
        let address = format!("{:?}", wallet.address()).to_lowercase();

        Ok(Self { id, address, wallet })
    }

    pub(crate) fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Fixed, ordered set of identities; read-only once loaded.
#[derive(Debug)]
pub struct IdentityPool {
    identities: Vec<Arc<SigningIdentity>>,
}

impl IdentityPool {
    pub fn new(identities: Vec<SigningIdentity>) -> Result<Self, LoadError> {
        if identities.is_empty() {
            return Err(LoadError::NoIdentities { slots: 0 });
        }
        Ok(Self {
            identities: identities.into_iter().map(Arc::new).collect(),
        })
    }

    /// Load identity slots `1..=slots`.
    pub async fn load(
        db: &Db,
        secrets: &dyn SecretService,
        slots: u32,
    ) -> Result<Self, LoadError> {
        let mut identities = Vec::new();

        for id in 1..=slots {
            let encrypted = match db.get_encrypted_key(id as i64) {
                Ok(Some(encrypted)) => encrypted,
                Ok(None) => {
                    log::warn!("[IDENTITY] No encrypted key for identity {}, skipping", id);
                    continue;
                }
                Err(e) => {
                    log::error!("[IDENTITY] Identity {} key lookup failed: {}", id, e);
                    continue;
                }
            };

            match load_one(db, secrets, id, &encrypted).await {
                Ok(identity) => {
                    log::info!(
                        "[IDENTITY] Identity {} initialized with address {}",
                        identity.id,
                        identity.address
                    );
                    identities.push(identity);
                }
                Err(e) => log::error!("[IDENTITY] Identity {} initialization failed: {}", id, e),
            }
        }

        if identities.is_empty() {
            return Err(LoadError::NoIdentities { slots });
        }

        log::info!(
            "[IDENTITY] Loaded {}/{} identities via {} secret service",
            identities.len(),
            slots,
            secrets.mode_name()
        );
        Self::new(identities)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<SigningIdentity>> {
        self.identities.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SigningIdentity>> {
        self.identities.iter()
    }
}

async fn load_one(
    db: &Db,
    secrets: &dyn SecretService,
    id: u32,
    encrypted: &str,
) -> Result<SigningIdentity, String> {
    let private_key = secrets.decrypt(encrypted).await?;
    let identity = SigningIdentity::from_private_key(id, &private_key)?;
    db.upsert_wallet(id as i64, &identity.address)?;
    Ok(identity)
}
