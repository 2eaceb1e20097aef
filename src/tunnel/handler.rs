//! The two ways a public request crosses into a tunnel's pool socket:
//! a normal HTTP request/response relay, and a WebSocket-upgrade splice.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

use super::Tunnel;
use crate::body::{self, BoxBody};
use crate::pool::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("no client socket available: {0}")]
    Acquire(#[from] PoolError),
    #[error("upstream connection error: {0}")]
    Upstream(#[from] hyper::Error),
}

impl Tunnel {
    /// Acquire a pool socket, speak HTTP/1.1 over it, and relay the request
    /// through to whatever is listening on the other side of the tunnel.
    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody>, TunnelError> {
        let socket = self.pool().acquire().await?;
        let io = TokioIo::new(socket);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "tunnel client connection ended");
            }
        });

        let response = sender.send_request(req).await?;
        let (parts, incoming) = response.into_parts();
        let body = incoming.map_err(|e| Box::new(e) as body::BoxError).boxed();
        Ok(Response::from_parts(parts, body))
    }

    /// Acquire a pool socket and bridge a WebSocket (or other `Upgrade:`)
    /// handshake through it: the request is relayed like any other, but if
    /// the tunneled server answers `101 Switching Protocols` both sides are
    /// pulled out of hyper's HTTP machinery and spliced byte-for-byte.
    pub async fn handle_upgrade(
        &self,
        mut req: Request<Incoming>,
    ) -> Result<Response<BoxBody>, TunnelError> {
        let socket = self.pool().acquire().await?;
        let io = TokioIo::new(socket);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        let conn = conn.with_upgrades();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "tunnel client connection ended");
            }
        });

        let client_upgrade = hyper::upgrade::on(&mut req);
        let mut upstream_response = sender.send_request(req).await?;

        if upstream_response.status() != StatusCode::SWITCHING_PROTOCOLS {
            let (parts, incoming) = upstream_response.into_parts();
            let body = incoming.map_err(|e| Box::new(e) as body::BoxError).boxed();
            return Ok(Response::from_parts(parts, body));
        }

        let upstream_upgrade = hyper::upgrade::on(&mut upstream_response);
        let (parts, _) = upstream_response.into_parts();

        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client_side, upstream_side)) => {
                    let mut client_io = TokioIo::new(client_side);
                    let mut upstream_io = TokioIo::new(upstream_side);
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
                    {
                        tracing::debug!(error = %e, "upgraded tunnel stream ended");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "websocket upgrade handshake failed"),
            }
        });

        Ok(Response::from_parts(parts, body::empty()))
    }
}
