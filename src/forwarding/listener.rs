//! Local listener plumbing shared by local and dynamic forwards

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::relay::{new_stats, ForwardStats, SharedStats};
use crate::ssh::{DisconnectReason, ForwardError, HandleController};

/// Bind, mapping the common failures to readable errors
pub async fn bind(addr: &str) -> Result<TcpListener, ForwardError> {
    TcpListener::bind(addr).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => ForwardError::AddrInUse(addr.to_string()),
        std::io::ErrorKind::PermissionDenied => ForwardError::PermissionDenied(addr.to_string()),
        std::io::ErrorKind::AddrNotAvailable => ForwardError::AddrNotAvailable(addr.to_string()),
        _ => ForwardError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        },
    })
}

/// A running accept loop
pub struct ListenerHandle {
    pub bound_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: SharedStats,
}

impl ListenerHandle {
    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Close the listener and every relay it spawned. The port is free
    /// once this returns.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Listener task for {} failed: {}", self.bound_addr, e);
        }
        info!("Listener on {} closed", self.bound_addr);
    }
}

/// Per-connection context handed to the connection handler
pub struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub controller: HandleController,
    pub stats: SharedStats,
    pub shutdown: watch::Receiver<bool>,
}

/// Run an accept loop on `listener`, spawning `serve` for each connection.
/// The loop ends on shutdown or when the transport disconnects.
pub fn spawn_accept_loop<F, Fut>(
    listener: TcpListener,
    controller: HandleController,
    serve: F,
) -> Result<ListenerHandle, ForwardError>
where
    F: Fn(Accepted) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let bound_addr = listener.local_addr().map_err(|e| ForwardError::Bind {
        addr: "listener".into(),
        reason: e.to_string(),
    })?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let relay_shutdown = shutdown_rx.clone();
    let stats = new_stats();
    let loop_stats = stats.clone();
    let mut disconnect_rx = controller.subscribe_disconnect();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => break,

                reason = disconnect_rx.recv() => {
                    if let Ok(DisconnectReason::TransportClosed) = reason {
                        debug!("Transport lost, closing listener {}", bound_addr);
                    }
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        debug!("Accepted {} on {}", peer, bound_addr);
                        tokio::spawn(serve(Accepted {
                            stream,
                            peer,
                            controller: controller.clone(),
                            stats: loop_stats.clone(),
                            shutdown: relay_shutdown.clone(),
                        }));
                    }
                    Err(e) => {
                        error!("Accept error on {}: {}", bound_addr, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        // `listener` drops here, releasing the port
    });

    Ok(ListenerHandle {
        bound_addr,
        shutdown_tx,
        task,
        stats,
    })
}
