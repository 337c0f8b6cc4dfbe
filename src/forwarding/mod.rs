//! Port Forwarding Module
//!
//! Local, remote and dynamic (SOCKS5) forwarding over one SSH transport.

mod dynamic;
mod listener;
mod local;
pub mod manager;
mod port;
pub mod relay;
pub mod remote;

pub use dynamic::start_dynamic_forward;
pub use listener::ListenerHandle;
pub use local::start_local_forward;
pub use manager::{ForwardInfo, PortForwardManager};
pub use port::{ForwardKind, ForwardedPort};
pub use relay::{splice, ForwardStats};
pub use remote::{relay_forwarded_connection, RemoteForwardTable, RemoteRoute};
