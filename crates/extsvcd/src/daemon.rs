//! `extsvcd start`: the watcher under a leadership driver, until a signal.

use std::sync::Arc;

use extsvc_backend::Backend;
use extsvc_watcher::{ExternalServiceWatcher, LeadershipDriver, WatcherConfig};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

pub async fn run(
    backend: Arc<dyn Backend>,
    node: String,
    config: WatcherConfig,
) -> anyhow::Result<()> {
    info!(
        %node,
        wait_time = ?config.wait_time,
        leadership_poll = ?config.leadership_poll,
        session_ttl = ?config.session.ttl,
        "extsvcd starting"
    );

    let watcher = Arc::new(ExternalServiceWatcher::new(backend, &node, config).await?);
    let driver = LeadershipDriver::new(watcher, config.leadership_poll);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver_handle = tokio::spawn(driver.run(shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    // The driver destroys the watcher (loops, lock, session) on its way out.
    driver_handle.await??;
    info!(%node, "extsvcd stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
