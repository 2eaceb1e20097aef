//! A single client's tunnel: its socket pool plus the pending/online/offline/
//! closed state machine and grace timers built on top of it.

pub mod handler;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::pool::{PoolError, PoolStats, SocketPool};

const FIRST_CONNECT_GRACE: Duration = Duration::from_secs(5);
const OFFLINE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    PendingFirstConnect,
    Online,
    Offline,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct TunnelStats {
    pub port: u16,
    pub max_sockets: u32,
    pub connected_sockets: u32,
}

pub struct Tunnel {
    id: String,
    pool: SocketPool,
    port: u16,
    max_sockets: u32,
    state_tx: watch::Sender<TunnelState>,
}

impl Tunnel {
    /// Allocate a socket pool, bind its listener, and start the grace-timer
    /// supervisor. Fails only if the listener can't be bound.
    pub async fn new(id: String, max_sockets: u32) -> Result<Arc<Self>, PoolError> {
        let pool = SocketPool::new(max_sockets, max_sockets.saturating_mul(2));
        let port = pool.start().await?;
        let (state_tx, _) = watch::channel(TunnelState::PendingFirstConnect);

        let tunnel = Arc::new(Self {
            id,
            pool,
            port,
            max_sockets,
            state_tx,
        });

        tokio::spawn(supervise(Arc::clone(&tunnel)));
        Ok(tunnel)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> TunnelState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> TunnelStats {
        let PoolStats { connected_sockets } = self.pool.stats();
        TunnelStats {
            port: self.port,
            max_sockets: self.max_sockets,
            connected_sockets,
        }
    }

    /// Idempotent. Marks the tunnel closed and tears down its pool; safe to
    /// call from the grace-timer supervisor, the control plane, or
    /// `Registry::remove`.
    pub async fn close(&self) {
        let became_closed = self.state_tx.send_if_modified(|s| {
            if *s == TunnelState::Closed {
                false
            } else {
                *s = TunnelState::Closed;
                true
            }
        });
        if became_closed {
            self.pool.close().await;
        }
    }

    pub(crate) fn pool(&self) -> &SocketPool {
        &self.pool
    }
}

/// Drives Pending→Online→Offline→Closed off the pool's online/offline
/// signal plus a single reusable grace timer: 5s for the first connect, 1s
/// for each subsequent offline spell. Whichever durations are active, the
/// timer firing while still in a "bad" state always closes the tunnel.
async fn supervise(tunnel: Arc<Tunnel>) {
    let mut online_rx = tunnel.pool.subscribe_online();

    let grace = tokio::time::sleep(FIRST_CONNECT_GRACE);
    tokio::pin!(grace);
    let mut grace_active = true;

    loop {
        tokio::select! {
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if *online_rx.borrow() {
                    grace_active = false;
                    let _ = tunnel.state_tx.send(TunnelState::Online);
                } else {
                    grace_active = true;
                    grace.as_mut().reset(tokio::time::Instant::now() + OFFLINE_GRACE);
                    let _ = tunnel.state_tx.send(TunnelState::Offline);
                }
            }
            () = &mut grace, if grace_active => {
                break;
            }
        }
    }

    tunnel.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn closes_if_no_first_connect_arrives() {
        // Relies on the production grace constant, so this exercises the
        // real timing end to end rather than an injected short one.
        let tunnel = Tunnel::new("t1".into(), 2).await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::PendingFirstConnect);
        let mut rx = tunnel.subscribe_state();
        tokio::time::timeout(Duration::from_secs(6), async {
            loop {
                if *rx.borrow() == TunnelState::Closed {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("tunnel should close after first-connect grace elapses");
    }

    #[tokio::test]
    async fn goes_online_on_first_connect_and_survives_beyond_grace() {
        let tunnel = Tunnel::new("t2".into(), 2).await.unwrap();
        let port = tunnel.port();
        let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let mut rx = tunnel.subscribe_state();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if *rx.borrow() == TunnelState::Online {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("tunnel should go online once a socket connects");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(tunnel.state(), TunnelState::Online);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let tunnel = Tunnel::new("t3".into(), 2).await.unwrap();
        tunnel.close().await;
        tunnel.close().await;
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }
}
