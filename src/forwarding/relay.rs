//! Splice relay between a local stream and an SSH channel stream
//!
//! Each direction is pumped by its own future over split halves. Whichever
//! direction ends first (EOF, error or idle) ends the relay and both write
//! halves are shut down, so the peer on either side sees the close.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

/// Idle timeout for a relayed connection
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const BUF_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    pub connection_count: u64,
    pub active_connections: u64,
    /// Local side to channel
    pub bytes_sent: u64,
    /// Channel to local side
    pub bytes_received: u64,
}

pub type SharedStats = Arc<RwLock<ForwardStats>>;

pub fn new_stats() -> SharedStats {
    Arc::new(RwLock::new(ForwardStats::default()))
}

/// Relay bytes until either side closes, the connection idles out, or
/// `shutdown` flips to true (or its sender is dropped).
///
/// `remote` is normally `channel.into_stream()`.
pub async fn splice<L, R>(
    local: L,
    remote: R,
    stats: SharedStats,
    mut shutdown: watch::Receiver<bool>,
) where
    L: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    {
        let mut s = stats.write();
        s.connection_count += 1;
        s.active_connections += 1;
    }

    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    {
        let sent = stats.clone();
        let received = stats.clone();
        let upstream = pump(&mut local_read, &mut remote_write, "local", move |n| {
            sent.write().bytes_sent += n
        });
        let downstream = pump(&mut remote_read, &mut local_write, "channel", move |n| {
            received.write().bytes_received += n
        });

        tokio::select! {
            _ = upstream => {}
            _ = downstream => {}
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                debug!("Relay cancelled");
            }
        }
    }

    let _ = remote_write.shutdown().await;
    let _ = local_write.shutdown().await;

    let mut s = stats.write();
    s.active_connections = s.active_connections.saturating_sub(1);
}

/// Copy `from` into `to` until EOF, an I/O error or the idle timeout
async fn pump<Rd, Wr, F>(from: &mut Rd, to: &mut Wr, side: &str, count: F)
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        match tokio::time::timeout(IDLE_TIMEOUT, from.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                count(n as u64);
                if let Err(e) = to.write_all(&buf[..n]).await {
                    debug!("Relay write error from {} side: {}", side, e);
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!("Relay {} read error: {}", side, e);
                break;
            }
            Err(_) => {
                debug!("Relay {} side idle for {}s", side, IDLE_TIMEOUT.as_secs());
                break;
            }
        }
    }
}
