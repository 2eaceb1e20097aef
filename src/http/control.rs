//! Control-plane HTTP routes: tunnel creation/inspection/deletion, status,
//! and the landing-page redirect (§4.5, §6).

use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;

use crate::body::{self, BoxBody};
use crate::id;
use crate::state::AppState;

#[derive(Serialize)]
struct StatusResponse {
    tunnels: usize,
    mem: u64,
}

#[derive(Serialize)]
struct TunnelStatusResponse {
    connected_sockets: u32,
}

#[derive(Serialize)]
struct CreatedResponse {
    id: String,
    port: u16,
    max_conn_count: u32,
    url: String,
}

#[derive(Serialize)]
struct DeletedResponse {
    deleted_client_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
}

pub async fn route(state: &Arc<AppState>, host: String, req: Request<Incoming>) -> Response<BoxBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let wants_new = has_query_flag(req.uri().query(), "new");

    match (&method, path.as_str()) {
        (&Method::GET, "/api/status") => status(state),
        (&Method::GET, p) if p.starts_with("/api/tunnels/") && p.ends_with("/status") => {
            let tunnel_id = &p["/api/tunnels/".len()..p.len() - "/status".len()];
            tunnel_status(state, tunnel_id)
        }
        (&Method::DELETE, p) if p.starts_with("/api/tunnels/") => {
            let tunnel_id = &p["/api/tunnels/".len()..];
            delete_tunnel(state, tunnel_id).await
        }
        (&Method::GET, "/") if wants_new => create_tunnel(state, &host, id::generate()).await,
        (&Method::GET, "/") => landing_redirect(state),
        (&Method::GET, p) if p.len() > 1 => {
            let requested = p.trim_start_matches('/');
            if !id::is_valid(requested) {
                invalid_subdomain()
            } else {
                create_tunnel(state, &host, requested.to_string()).await
            }
        }
        _ => method_not_allowed(),
    }
}

fn has_query_flag(query: Option<&str>, flag: &str) -> bool {
    query
        .map(|q| q.split('&').any(|kv| kv == flag || kv.starts_with(&format!("{flag}="))))
        .unwrap_or(false)
}

fn status(state: &Arc<AppState>) -> Response<BoxBody> {
    let stats = state.registry.stats();
    json_response(
        StatusCode::OK,
        &StatusResponse {
            tunnels: stats.tunnels,
            mem: resident_memory_bytes(),
        },
    )
}

fn tunnel_status(state: &Arc<AppState>, tunnel_id: &str) -> Response<BoxBody> {
    match state.registry.get(tunnel_id) {
        Some(tunnel) => json_response(
            StatusCode::OK,
            &TunnelStatusResponse {
                connected_sockets: tunnel.stats().connected_sockets,
            },
        ),
        None => method_not_allowed(),
    }
}

async fn delete_tunnel(state: &Arc<AppState>, tunnel_id: &str) -> Response<BoxBody> {
    if !state.registry.has(tunnel_id) {
        return method_not_allowed();
    }
    state.registry.remove(tunnel_id).await;
    json_response(
        StatusCode::OK,
        &DeletedResponse {
            deleted_client_id: tunnel_id.to_string(),
        },
    )
}

async fn create_tunnel(state: &Arc<AppState>, host: &str, tunnel_id: String) -> Response<BoxBody> {
    match state.registry.create(tunnel_id.clone()).await {
        Ok(tunnel) => {
            let scheme = if state.config.secure { "https" } else { "http" };
            let url = format!("{scheme}://{tunnel_id}.{host}");
            json_response(
                StatusCode::OK,
                &CreatedResponse {
                    id: tunnel_id,
                    port: tunnel.port(),
                    max_conn_count: state.config.max_tcp_sockets(),
                    url,
                },
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to start tunnel");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(body::empty())
                .unwrap()
        }
    }
}

fn invalid_subdomain() -> Response<BoxBody> {
    json_response(
        StatusCode::FORBIDDEN,
        &ErrorResponse {
            message: "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 \
                      alphanumeric characters."
                .to_string(),
        },
    )
}

fn landing_redirect(state: &Arc<AppState>) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, state.config.landing.as_str())
        .body(body::empty())
        .unwrap()
}

fn method_not_allowed() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .body(body::full("405"))
        .unwrap()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(body::full(bytes))
        .unwrap()
}

/// Resident set size in bytes, best-effort via `/proc/self/status`. `0` on
/// any platform or parse failure, as permitted by the spec.
fn resident_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|contents| {
            contents.lines().find_map(|line| {
                line.strip_prefix("VmRSS:").map(|rest| {
                    rest.trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse::<u64>()
                        .unwrap_or(0)
                        * 1024
                })
            })
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_flag_matches_bare_and_valued_forms() {
        assert!(has_query_flag(Some("new"), "new"));
        assert!(has_query_flag(Some("foo=1&new"), "new"));
        assert!(has_query_flag(Some("new=1"), "new"));
        assert!(!has_query_flag(Some("newsletter"), "new"));
        assert!(!has_query_flag(None, "new"));
    }
}
