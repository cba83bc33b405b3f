//! Process shutdown on SIGINT/SIGTERM.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerConnection;
use crate::db::Db;

/// Resolves on the first SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<&'static str, String> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| format!("Failed to listen for SIGINT: {}", e))?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<&'static str, String> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for Ctrl+C: {}", e))?;
    Ok("SIGINT")
}

pub struct ShutdownCoordinator {
    dispatch_cancel: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
    broker: Arc<BrokerConnection>,
    db: Arc<Db>,
}

impl ShutdownCoordinator {
    pub fn new(
        dispatch_cancel: CancellationToken,
        dispatcher: Option<JoinHandle<()>>,
        broker: Arc<BrokerConnection>,
        db: Arc<Db>,
    ) -> Self {
        Self {
            dispatch_cancel,
            dispatcher,
            broker,
            db,
        }
    }

    /// Stop consuming, close the broker connection, then the record store.
    /// Both closes are attempted; the first error is returned.
    pub async fn shutdown(self) -> Result<(), String> {
        log::info!("[SHUTDOWN] Stopping dispatch loop");
        self.dispatch_cancel.cancel();
        if let Some(handle) = self.dispatcher {
            if let Err(e) = handle.await {
                log::warn!("[SHUTDOWN] Dispatch task ended abnormally: {}", e);
            }
        }

        log::info!("[SHUTDOWN] Closing broker connection");
        let broker_result = self
            .broker
            .close()
            .await
            .map_err(|e| format!("Failed to close broker connection: {}", e));
        if let Err(e) = &broker_result {
            log::error!("[SHUTDOWN] {}", e);
        }

        log::info!("[SHUTDOWN] Closing record store");
        let db_result = self.db.close();
        if let Err(e) = &db_result {
            log::error!("[SHUTDOWN] {}", e);
        }

        broker_result.and(db_result)?;
        log::info!("[SHUTDOWN] Clean shutdown");
        Ok(())
    }
}
