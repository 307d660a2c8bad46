use anyhow::Result;
use kernel_relay_server::{Server, ServerConfig, telemetry};
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();

    // Configuration from KR_* environment variables, defaults otherwise.
    let config = ServerConfig::from_env()?;
    let server = Server::bind(config).await?;
    server.run_until(shutdown_signal()).await
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
