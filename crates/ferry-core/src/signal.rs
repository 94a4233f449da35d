//! Process signals that stop the pipelines.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for SIGINT, SIGTERM or SIGQUIT and return its name.
///
/// A signal whose handler cannot be installed is never reported.
#[cfg(unix)]
pub async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    async fn wait_for(kind: SignalKind, name: &'static str) -> &'static str {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
                name
            }
            Err(e) => {
                warn!(signal = name, error = %e, "Failed to install signal handler");
                std::future::pending().await
            }
        }
    }

    tokio::select! {
        name = wait_for(SignalKind::interrupt(), "SIGINT") => name,
        name = wait_for(SignalKind::terminate(), "SIGTERM") => name,
        name = wait_for(SignalKind::quit(), "SIGQUIT") => name,
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    "CTRL_C"
}

/// Cancel `shutdown` on the first shutdown signal.
///
/// The task ends quietly when the token is cancelled some other way, such as
/// every pipeline finishing on its own.
pub fn cancel_on_signal(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(signal) = shutdown.run_until_cancelled(shutdown_signal()).await {
            info!(signal, "Shutdown signal received; stopping pipelines");
            shutdown.cancel();
        }
    })
}
