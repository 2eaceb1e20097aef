//! Per-tunnel pool of inbound TCP sockets originated by the remote client.
//!
//! Owns a listener on an ephemeral port, a FIFO of idle sockets and a FIFO
//! of parked consumers (the two are never simultaneously non-empty), and
//! enforces the soft/hard socket caps described in the tunnel spec.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::net;

/// Errors surfaced by pool operations. Routine socket churn never reaches
/// here — only pool-level, caller-visible conditions do.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("socket pool is closed")]
    Closed,
    #[error("socket pool already started")]
    AlreadyStarted,
    #[error("failed to bind pool listener: {0}")]
    ListenFailed(#[from] io::Error),
}

/// Point-in-time counters for `/api/tunnels/:id/status`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub connected_sockets: u32,
}

struct IdleEntry {
    id: u64,
    socket: Arc<TcpStream>,
    watcher: JoinHandle<()>,
}

struct PoolInner {
    available: VecDeque<IdleEntry>,
    pending: VecDeque<oneshot::Sender<Result<PoolSocket, PoolError>>>,
    connected: u32,
    next_id: u64,
    closed: bool,
}

struct PoolShared {
    state: Mutex<PoolInner>,
    max_client_sockets: u32,
    max_tcp_sockets: u32,
    online_tx: watch::Sender<bool>,
    started: AtomicBool,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl PoolShared {
    /// Decrement the connected count and signal `offline` on the N→0 edge.
    /// Called by every path through which a socket actually goes away,
    /// whether idle, checked out, or evicted.
    async fn finish_departure(self: &Arc<Self>) {
        let became_zero = {
            let mut inner = self.state.lock();
            inner.connected = inner.connected.saturating_sub(1);
            inner.connected == 0
        };
        if became_zero {
            let _ = self.online_tx.send(false);
        }
    }

    /// An idle socket's watcher observed readiness (EOF or otherwise) while
    /// parked in `available`. Remove it if still present — it may already
    /// have been claimed by `acquire`, evicted, or dropped during close.
    async fn on_idle_readable(self: &Arc<Self>, id: u64) {
        let removed = {
            let mut inner = self.state.lock();
            let pos = inner.available.iter().position(|e| e.id == id);
            pos.map(|p| inner.available.remove(p).unwrap())
        };
        if removed.is_some() {
            // The watcher task (this one) holds one Arc clone and the
            // removed entry held another; both drop by the time this
            // function returns, closing the socket once unreferenced.
            self.finish_departure().await;
        }
    }

    /// Abort an idle entry's watcher, wait for it to actually finish (so its
    /// Arc clone is dropped), then gracefully end the underlying socket.
    async fn close_idle_entry(entry: IdleEntry) {
        entry.watcher.abort();
        let _ = entry.watcher.await;
        if let Ok(stream) = Arc::try_unwrap(entry.socket) {
            net::graceful_end(stream).await;
        }
    }
}

/// A socket checked out of the pool by a request/upgrade handler.
///
/// Implements `AsyncRead`/`AsyncWrite` by delegating to `&TcpStream` (the
/// same mechanism `TcpStream::split` relies on), so it can be handed
/// directly to hyper's client connection or to `copy_bidirectional`.
pub struct PoolSocket {
    id: u64,
    stream: Arc<TcpStream>,
    shared: Arc<PoolShared>,
}

impl PoolSocket {
    fn new(id: u64, stream: Arc<TcpStream>, shared: Arc<PoolShared>) -> Self {
        Self { id, stream, shared }
    }

    /// Stable identity of the underlying connection, useful for logging.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for PoolSocket {
    fn drop(&mut self) {
        let shared = Arc::clone(&self.shared);
        let stream = Arc::clone(&self.stream);
        tokio::spawn(async move {
            if let Ok(stream) = Arc::try_unwrap(stream) {
                net::graceful_end(stream).await;
            }
            shared.finish_departure().await;
        });
    }
}

impl AsyncRead for PoolSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut r: &TcpStream = &this.stream;
        Pin::new(&mut r).poll_read(cx, buf)
    }
}

impl AsyncWrite for PoolSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut w: &TcpStream = &this.stream;
        Pin::new(&mut w).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut w: &TcpStream = &this.stream;
        Pin::new(&mut w).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut w: &TcpStream = &this.stream;
        Pin::new(&mut w).poll_shutdown(cx)
    }
}

/// Per-tunnel pool of inbound client sockets.
#[derive(Clone)]
pub struct SocketPool {
    shared: Arc<PoolShared>,
}

impl SocketPool {
    pub fn new(max_client_sockets: u32, max_tcp_sockets: u32) -> Self {
        let (online_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolInner {
                    available: VecDeque::new(),
                    pending: VecDeque::new(),
                    connected: 0,
                    next_id: 0,
                    closed: false,
                }),
                max_client_sockets,
                max_tcp_sockets,
                online_tx,
                started: AtomicBool::new(false),
                listener_task: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to online/offline transitions. `true` means
    /// `connected_sockets > 0`. Sends happen exactly on the 0→1 and N→0
    /// edges, never on every accept/close.
    pub fn subscribe_online(&self) -> watch::Receiver<bool> {
        self.shared.online_tx.subscribe()
    }

    /// Bind an ephemeral TCP port and start accepting inbound client
    /// sockets. Calling this a second time is a programmer error.
    pub async fn start(&self) -> Result<u16, PoolError> {
        if self
            .shared
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PoolError::AlreadyStarted);
        }

        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let _ = stream.set_nodelay(true);
                        handle_accept(Arc::clone(&shared), stream);
                    }
                    Err(e) => net::log_listener_error(&e),
                }
            }
        });
        *self.shared.listener_task.lock() = Some(task);

        Ok(port)
    }

    /// Hand the caller an available socket, parking on the pending-consumer
    /// FIFO if none is free. Resolves with `PoolError::Closed` immediately
    /// (no queueing) if the pool has already been closed.
    pub async fn acquire(&self) -> Result<PoolSocket, PoolError> {
        enum Outcome {
            Ready(IdleEntry),
            Pending(oneshot::Receiver<Result<PoolSocket, PoolError>>),
            Closed,
        }

        let outcome = {
            let mut inner = self.shared.state.lock();
            if inner.closed {
                Outcome::Closed
            } else if let Some(entry) = inner.available.pop_front() {
                Outcome::Ready(entry)
            } else {
                let (tx, rx) = oneshot::channel();
                inner.pending.push_back(tx);
                Outcome::Pending(rx)
            }
        };

        match outcome {
            Outcome::Closed => Err(PoolError::Closed),
            Outcome::Ready(entry) => {
                entry.watcher.abort();
                let _ = entry.watcher.await;
                // Deliver on a deferred tick: mirrors the accept path's own
                // deferred hand-off and avoids any reentrancy between
                // Acquire and a concurrently running accept.
                tokio::task::yield_now().await;
                Ok(PoolSocket::new(entry.id, entry.socket, Arc::clone(&self.shared)))
            }
            Outcome::Pending(rx) => rx.await.unwrap_or(Err(PoolError::Closed)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            connected_sockets: self.shared.state.lock().connected,
        }
    }

    /// Stop accepting, drain both FIFOs, and gracefully close every idle
    /// socket. Idempotent.
    pub async fn close(&self) {
        let (idle, pendings) = {
            let mut inner = self.shared.state.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (
                inner.available.drain(..).collect::<Vec<_>>(),
                inner.pending.drain(..).collect::<Vec<_>>(),
            )
        };

        if let Some(task) = self.shared.listener_task.lock().take() {
            task.abort();
        }

        for tx in pendings {
            let _ = tx.send(Err(PoolError::Closed));
        }

        for entry in idle {
            PoolShared::close_idle_entry(entry).await;
            self.shared.finish_departure().await;
        }
    }
}

/// Accept-path handling for a single newly connected socket (§4.1).
fn handle_accept(shared: Arc<PoolShared>, stream: TcpStream) {
    enum Decision {
        Rejected,
        Pending(oneshot::Sender<Result<PoolSocket, PoolError>>, u64, Arc<TcpStream>),
        Available(u64),
    }

    let socket = Arc::new(stream);
    let was_zero;
    let decision = {
        let mut inner = shared.state.lock();
        if inner.connected >= shared.max_tcp_sockets {
            was_zero = false;
            Decision::Rejected
        } else {
            was_zero = inner.connected == 0;
            inner.connected += 1;
            let id = inner.next_id;
            inner.next_id += 1;

            if let Some(tx) = inner.pending.pop_front() {
                Decision::Pending(tx, id, Arc::clone(&socket))
            } else {
                inner.available.push_back(IdleEntry {
                    id,
                    socket: Arc::clone(&socket),
                    // Placeholder; replaced with the real watcher below
                    // once we're out of the lock (spawning requires an Arc
                    // clone we don't want to take while holding it).
                    watcher: tokio::spawn(std::future::pending::<()>()),
                });
                Decision::Available(id)
            }
        }
    };

    match decision {
        Decision::Rejected => {
            let stream = Arc::try_unwrap(socket)
                .expect("freshly accepted socket has no other Arc owners yet");
            tokio::spawn(net::graceful_end(stream));
        }
        Decision::Pending(tx, id, socket) => {
            if was_zero {
                let _ = shared.online_tx.send(true);
            }
            let shared2 = Arc::clone(&shared);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                let delivered = PoolSocket::new(id, socket, shared2);
                if tx.send(Ok(delivered)).is_err() {
                    // Consumer went away between park and delivery; the
                    // PoolSocket's own Drop will retire the connection.
                }
            });
        }
        Decision::Available(id) => {
            if was_zero {
                let _ = shared.online_tx.send(true);
            }
            let watcher_socket = Arc::clone(&socket);
            let watcher_shared = Arc::clone(&shared);
            let watcher = tokio::spawn(async move {
                let _ = watcher_socket.readable().await;
                watcher_shared.on_idle_readable(id).await;
            });

            let overflow = {
                let mut inner = shared.state.lock();
                if let Some(pos) = inner.available.iter().position(|e| e.id == id) {
                    // Swap in the real watcher, aborting the placeholder.
                    let placeholder = std::mem::replace(&mut inner.available[pos].watcher, watcher);
                    placeholder.abort();
                }
                if inner.available.len() as u32 > shared.max_client_sockets {
                    inner.available.pop_front()
                } else {
                    None
                }
            };

            if let Some(evicted) = overflow {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    PoolShared::close_idle_entry(evicted).await;
                    shared.finish_departure().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream as ClientStream;

    async fn dial(port: u16) -> ClientStream {
        ClientStream::connect(("127.0.0.1", port)).await.unwrap()
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let pool = SocketPool::new(10, 20);
        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn accept_then_acquire_delivers_same_connection() {
        let pool = SocketPool::new(10, 20);
        let port = pool.start().await.unwrap();
        let mut client = dial(port).await;
        client.write_all(b"hi").await.unwrap();

        // Give the accept loop a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(pool.stats().connected_sockets, 1);

        let mut socket = pool.acquire().await.unwrap();
        let mut buf = [0u8; 2];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn acquire_parks_until_a_socket_connects() {
        let pool = SocketPool::new(10, 20);
        let port = pool.start().await.unwrap();

        let pool2 = pool.clone();
        let handle = tokio::spawn(async move { pool2.acquire().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let _client = dial(port).await;

        let socket = handle.await.unwrap();
        assert!(socket.is_ok());
    }

    #[tokio::test]
    async fn close_fails_pending_and_future_acquires() {
        let pool = SocketPool::new(10, 20);
        pool.start().await.unwrap();

        let pool2 = pool.clone();
        let handle = tokio::spawn(async move { pool2.acquire().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        pool.close().await;

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PoolError::Closed)));
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_idle_and_rejects_beyond_hard_cap() {
        let pool = SocketPool::new(2, 4);
        let port = pool.start().await.unwrap();

        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(dial(port).await);
            tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        }

        // Hard cap is 4; the 5th connection must have been rejected.
        assert!(pool.stats().connected_sockets <= 4);
    }

    #[tokio::test]
    async fn online_offline_fire_exactly_once_per_edge() {
        let pool = SocketPool::new(10, 20);
        let port = pool.start().await.unwrap();
        let mut rx = pool.subscribe_online();
        assert!(!*rx.borrow());

        let client = dial(port).await;
        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        drop(client);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }

    /// Property 3: consumers parked before any socket exists are served in
    /// the same order they arrived, each bound to a distinct connection.
    #[tokio::test]
    async fn pending_consumers_are_served_in_arrival_order() {
        let pool = SocketPool::new(10, 20);
        let port = pool.start().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let pool2 = pool.clone();
            handles.push(tokio::spawn(async move { pool2.acquire().await }));
            // Ensure each consumer actually parks before the next one is
            // spawned, so arrival order is unambiguous.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        // Dial three inbound sockets in order, tagging each with a marker
        // byte so we can see which connection each consumer received.
        let mut clients = Vec::new();
        for tag in [b'1', b'2', b'3'] {
            let mut c = dial(port).await;
            c.write_all(&[tag]).await.unwrap();
            clients.push(c);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let mut received = Vec::new();
        for h in handles {
            let mut socket = h.await.unwrap().unwrap();
            let mut buf = [0u8; 1];
            socket.read_exact(&mut buf).await.unwrap();
            received.push(buf[0]);
        }

        assert_eq!(received, vec![b'1', b'2', b'3']);
    }

    /// Property 2: the available FIFO and the pending-consumer FIFO are
    /// never simultaneously non-empty.
    #[tokio::test]
    async fn available_and_pending_are_mutually_exclusive() {
        let pool = SocketPool::new(10, 20);
        let port = pool.start().await.unwrap();

        // No consumers yet: an accepted socket goes to the available FIFO.
        let _idle = dial(port).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(pool.stats().connected_sockets, 1);

        // Draining it via acquire empties `available` before any consumer
        // could be parked concurrently with it.
        let _socket = pool.acquire().await.unwrap();

        // Now park a consumer with nothing available; `available` must be
        // empty while this consumer is pending.
        let pool2 = pool.clone();
        let handle = tokio::spawn(async move { pool2.acquire().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let _fed = dial(port).await;
        let socket = handle.await.unwrap();
        assert!(socket.is_ok());
    }
}
