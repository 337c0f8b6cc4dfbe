//! Remote port forwarding
//!
//! The server listens on our behalf (`tcpip-forward`) and opens a
//! `forwarded-tcpip` channel per inbound connection. The client handler
//! routes each one through this session's table, matching on the bound
//! port only; anything unregistered is refused without dialing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use russh::client::Msg;
use russh::Channel;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::port::ForwardedPort;
use super::relay::{new_stats, splice, ForwardStats, SharedStats};
use crate::session::EventSink;

struct RemoteEntry {
    spec: ForwardedPort,
    stats: SharedStats,
    shutdown_tx: watch::Sender<bool>,
}

/// Where an accepted forwarded connection goes
pub struct RemoteRoute {
    pub spec: ForwardedPort,
    stats: SharedStats,
    shutdown: watch::Receiver<bool>,
}

/// Per-session registry of granted remote forwards, keyed by bound port
#[derive(Clone, Default)]
pub struct RemoteForwardTable {
    entries: Arc<RwLock<HashMap<u32, RemoteEntry>>>,
}

impl RemoteForwardTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `spec.port` must be the port the server actually bound
    pub fn register(&self, spec: ForwardedPort) {
        let (shutdown_tx, _) = watch::channel(false);
        debug!("Registered remote forward {}", spec);
        self.entries.write().insert(
            spec.port as u32,
            RemoteEntry {
                spec,
                stats: new_stats(),
                shutdown_tx,
            },
        );
    }

    /// Remove the entry and close its in-flight relays
    pub fn unregister(&self, port: u32) -> Option<ForwardedPort> {
        let entry = self.entries.write().remove(&port)?;
        let _ = entry.shutdown_tx.send(true);
        Some(entry.spec)
    }

    pub fn contains(&self, port: u32) -> bool {
        self.entries.read().contains_key(&port)
    }

    pub fn stats(&self, port: u32) -> Option<ForwardStats> {
        self.entries.read().get(&port).map(|e| e.stats.read().clone())
    }

    pub fn clear(&self) {
        for (_, entry) in self.entries.write().drain() {
            let _ = entry.shutdown_tx.send(true);
        }
    }

    /// Look up the forward for an inbound connection. A miss is reported
    /// to the user.
    pub fn route(&self, connected_port: u32, events: &EventSink) -> Option<RemoteRoute> {
        let entries = self.entries.read();
        match entries.get(&connected_port) {
            Some(entry) => Some(RemoteRoute {
                spec: entry.spec.clone(),
                stats: entry.stats.clone(),
                shutdown: entry.shutdown_tx.subscribe(),
            }),
            None => {
                drop(entries);
                warn!("forwarded-tcpip for unregistered port {}", connected_port);
                events.service_message(format!(
                    " X  Rejected incoming forwarded connection for unrecognized port {}",
                    connected_port
                ));
                None
            }
        }
    }
}

/// Dial the local target for a routed connection and splice
pub async fn relay_forwarded_connection(
    route: RemoteRoute,
    channel: Channel<Msg>,
    originator: String,
    events: EventSink,
) {
    let target = format!("{}:{}", route.spec.target_address, route.spec.target_port);

    let stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            events.service_message(format!(
                " X  Could not forward the remote connection to {}: {}",
                target, e
            ));
            let _ = channel.close().await;
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    debug!("Relaying forwarded connection from {} to {}", originator, target);
    splice(stream, channel.into_stream(), route.stats, route.shutdown).await;
}
