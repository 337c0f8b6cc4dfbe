//! Dynamic forwarding (SOCKS5 proxy)
//!
//! A local SOCKS5 listener with no authentication. The destination of each
//! connection comes from the client's CONNECT request, not from the rule.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::listener::{bind, spawn_accept_loop, Accepted, ListenerHandle};
use super::port::ForwardedPort;
use super::relay::{splice, SharedStats};
use crate::session::EventSink;
use crate::ssh::{ForwardError, HandleController};

/// SOCKS5 protocol constants (RFC 1928)
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

pub async fn start_dynamic_forward(
    controller: HandleController,
    spec: &ForwardedPort,
    events: EventSink,
) -> Result<ListenerHandle, ForwardError> {
    let listener = bind(&spec.bind_addr()).await?;
    let mut spec = spec.clone();
    if let Ok(addr) = listener.local_addr() {
        spec.port = addr.port();
    }
    let spec = Arc::new(spec);

    spawn_accept_loop(listener, controller, move |conn| {
        let Accepted {
            stream,
            peer,
            controller,
            stats,
            shutdown,
        } = conn;
        let spec = spec.clone();
        let events = events.clone();
        async move {
            let client = SocksClient {
                peer,
                controller,
                stats,
                shutdown,
                spec,
                events,
            };
            if let Err(e) = client.serve(stream).await {
                debug!("SOCKS5 client {} failed: {}", peer, e);
            }
        }
    })
}

struct SocksClient {
    peer: SocketAddr,
    controller: HandleController,
    stats: SharedStats,
    shutdown: watch::Receiver<bool>,
    spec: Arc<ForwardedPort>,
    events: EventSink,
}

impl SocksClient {
    async fn serve<S>(self, mut stream: S) -> Result<(), ForwardError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (host, port) = handshake(&mut stream).await?;
        debug!("SOCKS5 {} requests {}:{}", self.peer, host, port);

        let channel = match self
            .controller
            .open_direct_tcpip(&host, port as u32, &self.peer.ip().to_string(), self.peer.port() as u32)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                warn!("SOCKS5 channel to {}:{} failed: {}", host, port, e);
                self.events.service_message(format!(
                    " X  Remote has rejected the forwarded connection to {}:{} via {}: {}",
                    host, port, self.spec, e
                ));
                send_reply(&mut stream, socks5::REP_HOST_UNREACHABLE).await?;
                return Err(ForwardError::RemoteRejected(e.to_string()));
            }
        };

        send_reply(&mut stream, socks5::REP_SUCCESS).await?;
        splice(stream, channel.into_stream(), self.stats, self.shutdown).await;
        Ok(())
    }
}

fn io_err(context: &str, e: std::io::Error) -> ForwardError {
    ForwardError::Socks(format!("{}: {}", context, e))
}

/// Run the greeting and CONNECT request, returning the requested target.
/// Unsupported requests are answered before the error is returned.
pub(crate) async fn handshake<S>(stream: &mut S) -> Result<(String, u16), ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 258];

    stream
        .read_exact(&mut buf[..2])
        .await
        .map_err(|e| io_err("greeting", e))?;
    if buf[0] != socks5::VERSION {
        return Err(ForwardError::Socks(format!("unsupported version {}", buf[0])));
    }
    let nmethods = buf[1] as usize;
    stream
        .read_exact(&mut buf[..nmethods])
        .await
        .map_err(|e| io_err("auth methods", e))?;

    if !buf[..nmethods].contains(&socks5::AUTH_NONE) {
        let _ = stream
            .write_all(&[socks5::VERSION, socks5::AUTH_NO_ACCEPTABLE])
            .await;
        return Err(ForwardError::Socks("client requires authentication".into()));
    }
    stream
        .write_all(&[socks5::VERSION, socks5::AUTH_NONE])
        .await
        .map_err(|e| io_err("auth reply", e))?;

    // VER CMD RSV ATYP
    stream
        .read_exact(&mut buf[..4])
        .await
        .map_err(|e| io_err("request", e))?;
    if buf[0] != socks5::VERSION {
        return Err(ForwardError::Socks("invalid version in request".into()));
    }
    let cmd = buf[1];
    let atyp = buf[3];

    if cmd != socks5::CMD_CONNECT {
        send_reply(stream, socks5::REP_CMD_NOT_SUPPORTED).await?;
        return Err(ForwardError::Socks(format!("unsupported command {}", cmd)));
    }

    let host = match atyp {
        socks5::ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream
                .read_exact(&mut octets)
                .await
                .map_err(|e| io_err("IPv4 address", e))?;
            Ipv4Addr::from(octets).to_string()
        }
        socks5::ATYP_DOMAIN => {
            let len = stream
                .read_u8()
                .await
                .map_err(|e| io_err("domain length", e))? as usize;
            stream
                .read_exact(&mut buf[..len])
                .await
                .map_err(|e| io_err("domain", e))?;
            String::from_utf8_lossy(&buf[..len]).into_owned()
        }
        socks5::ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream
                .read_exact(&mut octets)
                .await
                .map_err(|e| io_err("IPv6 address", e))?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            send_reply(stream, socks5::REP_ADDR_NOT_SUPPORTED).await?;
            return Err(ForwardError::Socks(format!("unsupported address type {}", other)));
        }
    };

    let port = stream.read_u16().await.map_err(|e| io_err("port", e))?;
    Ok((host, port))
}

/// VER REP RSV ATYP BND.ADDR BND.PORT, always bound to 0.0.0.0:0
async fn send_reply<S>(stream: &mut S, status: u8) -> Result<(), ForwardError>
where
    S: AsyncWrite + Unpin,
{
    let reply = [socks5::VERSION, status, 0x00, socks5::ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream
        .write_all(&reply)
        .await
        .map_err(|e| io_err("reply", e))
}
