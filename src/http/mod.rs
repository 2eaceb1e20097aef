//! The public-facing HTTP server: per-connection routing between tunnels
//! and the control plane.

pub mod control;
pub mod dispatcher;

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::net;
use crate::state::AppState;

/// Accept public connections until `shutdown` fires.
pub async fn serve(state: Arc<AppState>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = SocketAddr::new(state.config.address, state.config.port);
    let listener = TcpListener::bind(addr).await?;
    serve_on(state, listener, shutdown).await
}

/// Same as [`serve`], but over an already-bound listener. Split out so
/// tests can bind an ephemeral port, read back the real address, and only
/// then start accepting.
pub async fn serve_on(
    state: Arc<AppState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "public dispatcher listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        net::log_listener_error(&e);
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { dispatcher::route(state, req).await }
                    });

                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(false)
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        // Includes the dispatcher's own deliberate
                        // `ConnectionClosed` (destroy-the-socket path for
                        // upgrade requests with no Host or no such tunnel),
                        // indistinguishable here from routine IO churn.
                        tracing::debug!(peer = %peer, error = %e, "connection error");
                    }
                });
            }
            _ = shutdown.changed() => {
                tracing::info!("public dispatcher shutting down");
                break;
            }
        }
    }

    Ok(())
}
