//! Per-request routing: resolve a `Host` header to a tunnel id, then either
//! hand the connection to that tunnel or to the control plane (§6).

use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};

use super::control;
use crate::body::{self, BoxBody};
use crate::hostname;
use crate::state::AppState;

/// Signals that the connection should be dropped with no response written
/// at all — §6 steps 1 and 4 require destroying the socket, not answering
/// with a status, when the offending request is an `Upgrade`.
#[derive(Debug, thiserror::Error)]
#[error("connection closed without a response")]
pub struct ConnectionClosed;

pub async fn route(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, ConnectionClosed> {
    let is_upgrade = is_upgrade_request(&req);

    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let Some(host) = host else {
        return if is_upgrade {
            Err(ConnectionClosed)
        } else {
            Ok(missing_host_response())
        };
    };

    let client_id = hostname::extract(&host, state.config.domain.as_deref());

    let Some(client_id) = client_id else {
        return Ok(control::route(&state, host, req).await);
    };

    let Some(tunnel) = state.registry.get(&client_id) else {
        return if is_upgrade {
            Err(ConnectionClosed)
        } else {
            Ok(no_such_tunnel_response())
        };
    };

    let response = if is_upgrade {
        tunnel.handle_upgrade(req).await
    } else {
        tunnel.handle_request(req).await
    };

    match response {
        Ok(response) => Ok(response),
        Err(e) => {
            // §9: `HandleRequest` answers Acquire/upstream failure with a
            // generic 502 rather than a silent drop, to avoid leaving the
            // public side hanging with no status at all.
            tracing::debug!(id = %client_id, error = %e, "tunnel relay failed");
            Ok(bad_gateway_response())
        }
    }
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);
    let connection_says_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().split(',').any(|tok| tok.trim() == "upgrade"))
        .unwrap_or(false);
    has_upgrade_header && connection_says_upgrade
}

fn missing_host_response() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(body::full("Host header is required"))
        .unwrap()
}

fn no_such_tunnel_response() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .body(body::full("405"))
        .unwrap()
}

fn bad_gateway_response() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(body::empty())
        .unwrap()
}
