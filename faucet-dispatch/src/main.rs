//! Faucet dispatch worker: consumes queued transfers and submits them through
//! the identity pool until SIGINT/SIGTERM.

use dotenv::dotenv;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use faucet_dispatch::broker::{AmqpConnector, BrokerConnection};
use faucet_dispatch::config::Config;
use faucet_dispatch::db::Db;
use faucet_dispatch::dispatch::Dispatcher;
use faucet_dispatch::identity::IdentityPool;
use faucet_dispatch::ledger::EthersLedger;
use faucet_dispatch::secrets::create_secret_service;
use faucet_dispatch::shutdown::{ShutdownCoordinator, wait_for_signal};

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();

    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<(), String> {
    let config = Config::from_env().map_err(|e| format!("Invalid configuration: {}", e))?;
    let rpc_url = config.require_rpc_url().map_err(|e| e.to_string())?;

    log::info!("Opening database at: {}", config.database_path);
    let db = Arc::new(
        Db::open(&config.database_path).map_err(|e| format!("Failed to open database: {}", e))?,
    );

    let secrets = create_secret_service()?;
    let pool = IdentityPool::load(&db, secrets.as_ref(), config.identity_slots)
        .await
        .map_err(|e| e.to_string())?;
    let ledger = Arc::new(EthersLedger::connect(rpc_url, config.chain_id).await?);

    let broker = BrokerConnection::new(
        Arc::new(AmqpConnector::new(config.rabbit_url.clone())),
        config.topology.clone(),
        config.reconnect_delay,
    );
    broker.connect();

    let dispatch_cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(&pool, ledger, broker.clone());
    let dispatch_handle = tokio::spawn(dispatcher.run(dispatch_cancel.clone()));

    match wait_for_signal().await {
        Ok(signal) => log::info!("[SHUTDOWN] Received {}", signal),
        Err(e) => log::error!("[SHUTDOWN] {}; shutting down", e),
    }

    ShutdownCoordinator::new(dispatch_cancel, Some(dispatch_handle), broker, db)
        .shutdown()
        .await
}
