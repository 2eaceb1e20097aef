//! Reverse tunnel server: exposes a subdomain per connected client and
//! relays public HTTP/WebSocket traffic through that client's inbound
//! socket pool.

pub mod app;
pub mod body;
pub mod config;
pub mod hostname;
pub mod http;
pub mod id;
pub mod net;
pub mod pool;
pub mod registry;
pub mod state;
pub mod tunnel;
