//! SSH transport layer
//!
//! Everything below the session: the connection profile, the russh client
//! handler, the task that owns the russh `Handle`, credentials (keys and
//! agent) and host key verification.

mod agent;
mod client;
mod config;
mod error;
mod handle_owner;
pub mod keys;
pub mod known_hosts;
pub mod transport;

pub use agent::{detect_agent, AgentLocation, SshAgentClient};
pub use client::ClientHandler;
pub use config::{
    AlgorithmType, AuthKind, ConnectionProfile, HostKeyPolicy, LoginScript, ALGORITHM_BLACKLIST,
};
pub use error::{AuthError, ErrorClass, ForwardError, ScriptError, SshError, X11Error};
pub use handle_owner::{spawn_handle_owner_task, DisconnectReason, HandleCommand, HandleController};
#[cfg(test)]
pub(crate) use handle_owner::{spawn_owner, testing::FakeOps};
pub use keys::{load_private_key, resolve_key_source, KeySource};
pub use known_hosts::{HostKeyStatus, KnownHostsStore};
