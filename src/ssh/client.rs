//! russh client handler
//!
//! Server-initiated events land here: host key checks, the auth banner,
//! and inbound `forwarded-tcpip` / `x11` channels. Each inbound channel is
//! handed to its relay on a separate task so the transport loop never
//! waits on local I/O.

use std::sync::Arc;

use russh::client::{self, Msg, Session};
use russh::keys::PublicKey;
use russh::Channel;
use tracing::{info, warn};

use super::config::HostKeyPolicy;
use super::error::SshError;
use super::known_hosts::{HostKeyStatus, KnownHostsStore};
use crate::forwarding::{relay_forwarded_connection, RemoteForwardTable};
use crate::session::EventSink;
use crate::x11::X11Relay;

pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHostsStore>,
    events: EventSink,
    skip_banner: bool,
    remote: RemoteForwardTable,
    x11: Option<X11Relay>,
}

impl ClientHandler {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        policy: HostKeyPolicy,
        known_hosts: Arc<KnownHostsStore>,
        events: EventSink,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            policy,
            known_hosts,
            events,
            skip_banner: false,
            remote: RemoteForwardTable::new(),
            x11: None,
        }
    }

    pub fn skip_banner(mut self, skip: bool) -> Self {
        self.skip_banner = skip;
        self
    }

    /// Table consulted for inbound `forwarded-tcpip` channels
    pub fn with_remote_forwards(mut self, remote: RemoteForwardTable) -> Self {
        self.remote = remote;
        self
    }

    /// Accept inbound X11 channels; without a relay they are closed
    pub fn with_x11(mut self, relay: X11Relay) -> Self {
        self.x11 = Some(relay);
        self
    }

    /// Apply the host key policy. `Err` aborts the handshake.
    fn verify_host_key(&self, key: &PublicKey) -> Result<bool, SshError> {
        let fingerprint = KnownHostsStore::fingerprint(key);
        self.events
            .service_message(format!("Host key fingerprint: {}", fingerprint));

        if self.policy == HostKeyPolicy::AcceptAndLog {
            warn!(
                "Accepting host key for {}:{} without verification ({})",
                self.host, self.port, fingerprint
            );
            return Ok(true);
        }

        match self.known_hosts.verify(&self.host, self.port, key) {
            HostKeyStatus::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyStatus::Unknown if self.policy == HostKeyPolicy::Strict => {
                warn!("Unknown host key for {}:{} in strict mode", self.host, self.port);
                Err(SshError::HostKeyRejected(format!(
                    "{}:{} is not in {} ({})",
                    self.host,
                    self.port,
                    self.known_hosts.path().display(),
                    fingerprint
                )))
            }
            HostKeyStatus::Unknown => {
                info!("New host {}:{}, adding to known_hosts", self.host, self.port);
                if let Err(e) = self.known_hosts.add_host(&self.host, self.port, key) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyStatus::Changed {
                expected_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected_fingerprint, fingerprint
                );
                self.events.service_message(format!(
                    " X  Host key for {}:{} has changed (expected {})",
                    self.host, self.port, expected_fingerprint
                ));
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} changed, expected {} but got {}. \
                     Remove the old entry from {} if the change is legitimate",
                    self.host,
                    self.port,
                    expected_fingerprint,
                    fingerprint,
                    self.known_hosts.path().display()
                )))
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        self.verify_host_key(server_public_key)
    }

    async fn auth_banner(&mut self, banner: &str, _session: &mut Session) -> Result<(), Self::Error> {
        if !self.skip_banner {
            self.events
                .service_message(format!("Shell banner: {}", banner.trim_end()));
        }
        Ok(())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let Some(route) = self.remote.route(connected_port, &self.events) else {
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
            return Ok(());
        };

        let originator = format!("{}:{}", originator_address, originator_port);
        let events = self.events.clone();
        tokio::spawn(relay_forwarded_connection(route, channel, originator, events));
        Ok(())
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let originator = format!("{}:{}", originator_address, originator_port);
        match self.x11.clone() {
            Some(relay) => {
                tokio::spawn(async move { relay.handle_channel(channel, originator).await });
            }
            None => {
                warn!("Unexpected X11 channel from {}, closing", originator);
                tokio::spawn(async move {
                    let _ = channel.close().await;
                });
            }
        }
        Ok(())
    }
}
