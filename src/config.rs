//! CLI / environment configuration surface.

use std::net::IpAddr;

use clap::Parser;

/// Reverse tunnel server: exposes a subdomain per connected client and
/// relays public HTTP/WebSocket traffic through that client's inbound
/// socket pool.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Port to listen on for public HTTP/WebSocket traffic and the
    /// control-plane API.
    #[arg(long, env = "TUNNELMUX_PORT", default_value_t = 80)]
    pub port: u16,

    /// Address to bind the public listener to.
    #[arg(long, env = "TUNNELMUX_ADDRESS", default_value = "0.0.0.0")]
    pub address: IpAddr,

    /// Registrable domain this server is reachable at. Restricts the
    /// hostname extractor to subdomains of this domain (plus the
    /// always-on `*.localhost` special case). Unset means "accept any
    /// multi-label host" (local/dev mode).
    #[arg(long, env = "TUNNELMUX_DOMAIN")]
    pub domain: Option<String>,

    /// Whether tunnel URLs returned by the control plane use https.
    #[arg(long, env = "TUNNELMUX_SECURE", default_value_t = false)]
    pub secure: bool,

    /// Soft cap on sockets a single tunnel client is expected to keep
    /// open; the hard cap is always twice this value.
    #[arg(long = "max-sockets", env = "TUNNELMUX_MAX_SOCKETS", default_value_t = 10)]
    pub max_sockets: u32,

    /// Landing page a bare `GET /` redirects to.
    #[arg(
        long,
        env = "TUNNELMUX_LANDING",
        default_value = "https://localtunnel.github.io/www/"
    )]
    pub landing: String,

    /// Emit structured JSON logs instead of human-readable ones.
    #[arg(long, env = "TUNNELMUX_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    /// Hard cap on concurrently accepted sockets per tunnel: `2 · max_sockets`.
    pub fn max_tcp_sockets(&self) -> u32 {
        self.max_sockets.saturating_mul(2)
    }
}
