//! Application lifecycle: tracing init, shared state, the public dispatcher,
//! and signal-driven shutdown.

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::http;
use crate::state::AppState;

/// Run the full application lifecycle after config has been parsed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        address = %config.address,
        domain = config.domain.as_deref().unwrap_or("<none>"),
        "tunnelmux starting"
    );

    let state = AppState::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = tokio::spawn(http::serve(state, shutdown_rx));

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up");
    let _ = shutdown_tx.send(true);

    match dispatcher.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "public dispatcher exited with an error"),
        Err(e) => tracing::error!(error = %e, "public dispatcher task panicked"),
    }

    info!("tunnelmux stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
