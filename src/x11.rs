//! X11 relay
//!
//! Bridges inbound `x11` channels opened by the server to the local X
//! display named by `DISPLAY`. A failed connection is reported and the
//! channel closed; the session is never affected.

use std::fmt;

use russh::client::Msg;
use russh::Channel;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::forwarding::relay::{new_stats, splice, SharedStats};
use crate::session::EventSink;
use crate::ssh::X11Error;

/// Parsed `DISPLAY` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplaySpec {
    /// `/path/to/socket`
    Unix(String),
    /// `[host]:display[.screen]`
    Tcp {
        host: String,
        display: u32,
        screen: u32,
    },
}

impl DisplaySpec {
    pub fn parse(spec: &str) -> Result<Self, X11Error> {
        if spec.starts_with('/') {
            return Ok(DisplaySpec::Unix(spec.to_string()));
        }

        let (host, rest) = spec
            .rsplit_once(':')
            .ok_or_else(|| X11Error::InvalidDisplay(spec.to_string()))?;
        let (display, screen) = rest.split_once('.').unwrap_or((rest, "0"));

        let parse = |v: &str| -> Result<u32, X11Error> {
            if v.is_empty() {
                Ok(0)
            } else {
                v.parse()
                    .map_err(|_| X11Error::InvalidDisplay(spec.to_string()))
            }
        };

        Ok(DisplaySpec::Tcp {
            host: host.to_string(),
            display: parse(display)?,
            screen: parse(screen)?,
        })
    }

    /// Current process display, `:0` when unset
    pub fn from_env() -> Result<Self, X11Error> {
        let spec = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string());
        Self::parse(&spec)
    }

    /// TCP port for the display; `None` for socket paths
    pub fn tcp_port(&self) -> Option<u16> {
        match self {
            DisplaySpec::Unix(_) => None,
            DisplaySpec::Tcp { display, .. } => {
                let port = if *display < 100 { display + 6000 } else { *display };
                u16::try_from(port).ok()
            }
        }
    }
}

impl fmt::Display for DisplaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplaySpec::Unix(path) => f.write_str(path),
            DisplaySpec::Tcp {
                host,
                display,
                screen,
            } => write!(f, "{}:{}.{}", host, display, screen),
        }
    }
}

/// Local X server connection
enum XStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

#[derive(Clone)]
pub struct X11Relay {
    events: EventSink,
    display: Option<String>,
    stats: SharedStats,
    shutdown: watch::Receiver<bool>,
}

impl X11Relay {
    /// `display` overrides `DISPLAY` (tests, embedders with their own X server)
    pub fn new(events: EventSink, display: Option<String>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            events,
            display,
            stats: new_stats(),
            shutdown,
        }
    }

    fn display_value(&self) -> String {
        self.display
            .clone()
            .or_else(|| std::env::var("DISPLAY").ok())
            .unwrap_or_else(|| ":0".to_string())
    }

    /// Serve one inbound X11 channel
    pub async fn handle_channel(&self, channel: Channel<Msg>, originator: String) {
        info!("Incoming X11 connection from {}", originator);
        let value = self.display_value();

        let spec = match DisplaySpec::parse(&value) {
            Ok(spec) => spec,
            Err(e) => {
                self.events
                    .service_message(format!(" X  Could not connect to the X server: {}", e));
                let _ = channel.close().await;
                return;
            }
        };

        match self.connect(&spec).await {
            Ok(XStream::Tcp(stream)) => {
                let _ = stream.set_nodelay(true);
                splice(
                    stream,
                    channel.into_stream(),
                    self.stats.clone(),
                    self.shutdown.clone(),
                )
                .await;
            }
            #[cfg(unix)]
            Ok(XStream::Unix(stream)) => {
                splice(
                    stream,
                    channel.into_stream(),
                    self.stats.clone(),
                    self.shutdown.clone(),
                )
                .await;
            }
            Err(e) => {
                self.report_failure(&spec, &value, &e);
                let _ = channel.close().await;
            }
        }
    }

    async fn connect(&self, spec: &DisplaySpec) -> Result<XStream, X11Error> {
        match spec {
            #[cfg(unix)]
            DisplaySpec::Unix(path) => tokio::net::UnixStream::connect(path)
                .await
                .map(XStream::Unix)
                .map_err(|e| X11Error::Connect(e.to_string())),
            #[cfg(not(unix))]
            DisplaySpec::Unix(path) => Err(X11Error::Connect(format!(
                "socket displays are not supported on this platform ({})",
                path
            ))),
            DisplaySpec::Tcp { host, display, .. } => {
                if host.is_empty() {
                    if let Some(stream) = connect_local_socket(*display).await {
                        return Ok(stream);
                    }
                }

                let port = spec
                    .tcp_port()
                    .ok_or_else(|| X11Error::InvalidDisplay(spec.to_string()))?;
                let host = if host.is_empty() { "localhost" } else { host.as_str() };
                TcpStream::connect((host, port))
                    .await
                    .map(XStream::Tcp)
                    .map_err(|e| X11Error::Connect(e.to_string()))
            }
        }
    }

    fn report_failure(&self, spec: &DisplaySpec, value: &str, err: &X11Error) {
        let reason = match err {
            X11Error::Connect(reason) => reason.clone(),
            other => other.to_string(),
        };
        self.events
            .service_message(format!(" X  Could not connect to the X server: {}", reason));

        let target = match spec {
            DisplaySpec::Unix(path) => path.clone(),
            DisplaySpec::Tcp { host, .. } => format!(
                "{}:{}",
                if host.is_empty() { "localhost" } else { host },
                spec.tcp_port().unwrap_or_default()
            ),
        };
        self.events.service_message(format!(
            "    Tried to connect to {} based on the DISPLAY environment var ({})",
            target, value
        ));

        if cfg!(windows) {
            self.events
                .service_message("    To use X forwarding, you need a local X server, e.g.:");
            self.events
                .service_message("    * VcXsrv: https://sourceforge.net/projects/vcxsrv/");
            self.events
                .service_message("    * Xming: https://sourceforge.net/projects/xming/");
        }
    }
}

/// The local server's socket for `:N`, tried before TCP
#[cfg(unix)]
async fn connect_local_socket(display: u32) -> Option<XStream> {
    let socket = format!("/tmp/.X11-unix/X{}", display);
    match tokio::net::UnixStream::connect(&socket).await {
        Ok(stream) => Some(XStream::Unix(stream)),
        Err(e) => {
            debug!("X11 socket {} unavailable: {}", socket, e);
            None
        }
    }
}

#[cfg(not(unix))]
async fn connect_local_socket(_display: u32) -> Option<XStream> {
    None
}
