//! SSH Error types
//!
//! Every failure the engine can produce is classified into one of the
//! families in [`ErrorClass`]. Only transport and auth failures end a
//! session; the rest are reported as service messages and absorbed.

use serde::Serialize;
use thiserror::Error;

/// Error family, used to decide whether a failure is session-fatal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Transport,
    Auth,
    Forward,
    Script,
    X11,
}

impl ErrorClass {
    /// Fatal classes move the session to `Failed` (or end it)
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorClass::Transport | ErrorClass::Auth)
    }
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Port forwarding failed: {0}")]
    Forward(#[from] ForwardError),

    #[error("X11 forwarding failed: {0}")]
    X11(#[from] X11Error),

    #[error("Login script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Secret store error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SshError::Auth(_) => ErrorClass::Auth,
            SshError::Forward(_) => ErrorClass::Forward,
            SshError::X11(_) => ErrorClass::X11,
            SshError::Script(_) => ErrorClass::Script,
            SshError::Secret(_) => ErrorClass::Auth,
            _ => ErrorClass::Transport,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::Auth(AuthError::Key(err.to_string()))
    }
}

impl Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Authentication failures
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("All configured authentication methods failed (tried: {})", tried.join(", "))]
    Exhausted { tried: Vec<String> },

    #[error("Key error: {0}")]
    Key(String),

    #[error("Private key requires a passphrase")]
    PassphraseRequired,

    #[error("Key conversion failed: {0}")]
    KeyConversion(String),

    #[error("SSH agent error: {0}")]
    Agent(String),

    #[error("Transport error during authentication: {0}")]
    Transport(String),
}

/// Port forwarding failures, never fatal to the session
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Port already in use: {0}")]
    AddrInUse(String),

    #[error("Permission denied binding to {0}")]
    PermissionDenied(String),

    #[error("Address not available: {0}")]
    AddrNotAvailable(String),

    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Remote rejected the request: {0}")]
    RemoteRejected(String),

    #[error("Unrecognized forwarded port {0}")]
    UnknownPort(u32),

    #[error("Forward not found: {0}")]
    NotFound(String),

    #[error("Session is not ready")]
    NotReady,

    #[error("SOCKS5 error: {0}")]
    Socks(String),
}

/// X11 relay failures, never fatal to the session
#[derive(Error, Debug)]
pub enum X11Error {
    #[error("Invalid DISPLAY value: {0}")]
    InvalidDisplay(String),

    #[error("Could not connect to the X server: {0}")]
    Connect(String),
}

/// Login script failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Login script timed out waiting for \"{expect}\"")]
    Timeout { expect: String },

    #[error("Invalid login script pattern \"{pattern}\": {reason}")]
    InvalidPattern { pattern: String, reason: String },
}
