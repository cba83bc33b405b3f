//! Operator tool for the faucet: provision identity keys, inspect identity
//! addresses, and queue a one-off transfer.

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;

use faucet_dispatch::broker::{AmqpConnector, BrokerConnection};
use faucet_dispatch::config::{Config, env_vars};
use faucet_dispatch::db::Db;
use faucet_dispatch::gateway::EnqueueGateway;
use faucet_dispatch::identity::SigningIdentity;
use faucet_dispatch::ingress::FundTransferIngress;
use faucet_dispatch::rate_limit::SqliteRateLimitStore;
use faucet_dispatch::secrets::EciesSecretService;

/// Client identifier used for rate limiting CLI requests
const CLI_CLIENT: &str = "cli";

const BROKER_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "faucetctl")]
#[command(about = "Operator tool for the faucet dispatch worker")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encrypt FAUCET_PRIVATE_KEY with FAUCET_ECIES_PUBLIC_KEY and store it for an identity slot
    StoreKey {
        /// Identity slot (1-based)
        worker_id: u32,
    },
    /// List identity slots and their public addresses
    Wallets,
    /// Queue a transfer through the ingress checks
    Enqueue {
        /// Recipient address
        to: String,
        /// Amount in whole native units
        amount: f64,
    },
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    if let Err(e) = run(args.command).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<(), String> {
    let config = Config::from_env().map_err(|e| format!("Invalid configuration: {}", e))?;

    match command {
        Command::StoreKey { worker_id } => store_key(&config, worker_id),
        Command::Wallets => list_wallets(&config),
        Command::Enqueue { to, amount } => enqueue(&config, &to, amount).await,
    }
}

fn open_db(config: &Config) -> Result<Db, String> {
    Db::open(&config.database_path).map_err(|e| format!("Failed to open database: {}", e))
}

fn required_env(name: &'static str) -> Result<String, String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| format!("{} must be set", name))
}

fn store_key(config: &Config, worker_id: u32) -> Result<(), String> {
    if worker_id == 0 {
        return Err("Identity slots start at 1".to_string());
    }

    let private_key = required_env(env_vars::PRIVATE_KEY)?;
    let public_key = required_env(env_vars::ECIES_PUBLIC_KEY)?;

    // Refuse to store anything that would not load as a signing identity
    let identity = SigningIdentity::from_private_key(worker_id, &private_key)?;
    let encrypted = EciesSecretService::encrypt_for(&public_key, private_key.trim())?;

    let db = open_db(config)?;
    db.store_encrypted_key(worker_id as i64, &encrypted)?;
    db.close()?;

    println!("Stored key for identity {} ({})", worker_id, identity.address);
    Ok(())
}

fn list_wallets(config: &Config) -> Result<(), String> {
    let db = open_db(config)?;
    let wallets = db.list_wallets()?;
    db.close()?;

    let json = serde_json::to_string_pretty(&wallets)
        .map_err(|e| format!("Failed to encode wallets: {}", e))?;
    println!("{}", json);
    Ok(())
}

async fn enqueue(config: &Config, to: &str, amount: f64) -> Result<(), String> {
    let db = Arc::new(open_db(config)?);

    let broker = BrokerConnection::new(
        Arc::new(AmqpConnector::new(config.rabbit_url.clone())),
        config.topology.clone(),
        config.reconnect_delay,
    );
    broker.connect();
    if let Err(e) = broker.wait_ready(BROKER_READY_TIMEOUT).await {
        let _ = broker.close().await;
        let _ = db.close();
        return Err(format!("Broker unavailable: {}", e));
    }

    let ingress = FundTransferIngress::new(
        EnqueueGateway::new(broker.clone()),
        Arc::new(SqliteRateLimitStore::new(db.clone())),
        config.max_amount,
        config.rate_limit_ttl,
    );
    let result = ingress.request_transfer(CLI_CLIENT, to, amount).await;

    broker
        .close()
        .await
        .map_err(|e| format!("Failed to close broker connection: {}", e))?;
    db.close()?;

    let receipt = result.map_err(|e| e.to_string())?;
    println!("{}", receipt.message);
    Ok(())
}
