//! Socket primitives shared across the pool and tunnel handlers.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// How long to wait for a graceful FIN before forcing the socket shut.
pub const GRACEFUL_END_TIMEOUT: Duration = Duration::from_millis(1000);

/// "end-or-destroy": attempt a clean shutdown (FIN), and if the peer hasn't
/// acknowledged within [`GRACEFUL_END_TIMEOUT`], drop the socket outright.
///
/// Used by every pool-owned close path (surplus sockets, eviction, pool
/// close, idle-socket EOF) so that a single misbehaving or slow peer can
/// never hold a close operation open indefinitely.
pub async fn graceful_end(mut stream: TcpStream) {
    let shutdown = stream.shutdown();
    if tokio::time::timeout(GRACEFUL_END_TIMEOUT, shutdown)
        .await
        .is_err()
    {
        tracing::debug!("graceful_end timed out, forcing socket closed");
    }
    // Dropping `stream` here closes the fd outright regardless of how the
    // shutdown above went.
}

/// Ignore the two errors the accept loop is expected to see routinely from
/// churning clients; log anything else.
pub fn log_listener_error(err: &std::io::Error) {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionReset | ErrorKind::TimedOut => {}
        _ => tracing::warn!(error = %err, "pool listener error"),
    }
}
