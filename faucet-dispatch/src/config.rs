use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable names
pub mod env_vars {
    pub const RABBIT_URL: &str = "FAUCET_RABBIT_URL";
    pub const QUEUE: &str = "FAUCET_QUEUE";
    pub const DEAD_LETTER_EXCHANGE: &str = "FAUCET_DLX";
    pub const DEAD_LETTER_QUEUE: &str = "FAUCET_DLQ";
    pub const RECONNECT_DELAY_SECS: &str = "FAUCET_RECONNECT_DELAY_SECS";
    pub const RPC_URL: &str = "FAUCET_RPC_URL";
    pub const CHAIN_ID: &str = "FAUCET_CHAIN_ID";
    pub const DB_PATH: &str = "FAUCET_DB_PATH";
    pub const IDENTITY_SLOTS: &str = "FAUCET_IDENTITY_SLOTS";
    pub const MAX_AMOUNT: &str = "FAUCET_MAX_AMOUNT";
    pub const RATE_LIMIT_TTL_SECS: &str = "FAUCET_RATE_LIMIT_TTL_SECS";
    pub const SECRET_MODE: &str = "FAUCET_SECRET_MODE";
    pub const ECIES_SECRET_KEY: &str = "FAUCET_ECIES_SECRET_KEY";
    pub const ECIES_PUBLIC_KEY: &str = "FAUCET_ECIES_PUBLIC_KEY";
    pub const KEYSTORE_URL: &str = "FAUCET_KEYSTORE_URL";
    pub const KEYSTORE_TOKEN: &str = "FAUCET_KEYSTORE_TOKEN";
    pub const PRIVATE_KEY: &str = "FAUCET_PRIVATE_KEY";
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Names and wiring of the durable queue topology.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    pub queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self {
            queue: "faucetQueue".to_string(),
            dead_letter_exchange: "faucet-dlx".to_string(),
            dead_letter_queue: "faucet-dlq".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rabbit_url: String,
    pub topology: QueueTopology,
    pub reconnect_delay: Duration,
    pub rpc_url: Option<String>,
    pub chain_id: Option<u64>,
    pub database_path: String,
    pub identity_slots: u32,
    pub max_amount: f64,
    pub rate_limit_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = QueueTopology::default();
        let max_amount: f64 = parse_or(env_vars::MAX_AMOUNT, 0.1)?;
        if !max_amount.is_finite() || max_amount <= 0.0 {
            return Err(ConfigError::Invalid {
                name: env_vars::MAX_AMOUNT,
                value: max_amount.to_string(),
            });
        }

        Ok(Self {
            rabbit_url: env::var(env_vars::RABBIT_URL)
                .unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string()),
            topology: QueueTopology {
                queue: env::var(env_vars::QUEUE).unwrap_or(defaults.queue),
                dead_letter_exchange: env::var(env_vars::DEAD_LETTER_EXCHANGE)
                    .unwrap_or(defaults.dead_letter_exchange),
                dead_letter_queue: env::var(env_vars::DEAD_LETTER_QUEUE)
                    .unwrap_or(defaults.dead_letter_queue),
            },
            reconnect_delay: Duration::from_secs(parse_or(env_vars::RECONNECT_DELAY_SECS, 5)?),
            rpc_url: env::var(env_vars::RPC_URL).ok().filter(|s| !s.is_empty()),
            chain_id: parse_optional(env_vars::CHAIN_ID)?,
            database_path: env::var(env_vars::DB_PATH).unwrap_or_else(|_| "./faucet.db".to_string()),
            identity_slots: parse_or(env_vars::IDENTITY_SLOTS, 5)?,
            max_amount,
            rate_limit_ttl: Duration::from_secs(parse_or(env_vars::RATE_LIMIT_TTL_SECS, 86_400)?),
        })
    }

    /// RPC URL, required by anything that talks to the ledger.
    pub fn require_rpc_url(&self) -> Result<&str, ConfigError> {
        self.rpc_url
            .as_deref()
            .ok_or(ConfigError::Missing(env_vars::RPC_URL))
    }
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    Ok(parse_optional(name)?.unwrap_or(default))
}

fn parse_optional<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        _ => Ok(None),
    }
}
