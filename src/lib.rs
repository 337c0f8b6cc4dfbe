//! OxideTerm SSH - the session engine behind an OxideTerm shell tab
//!
//! A [`SessionController`] connects one [`ConnectionProfile`], negotiates
//! authentication, opens the interactive shell and runs the profile's
//! login scripts over its output. While the session is ready it serves
//! local, remote and dynamic port forwards and relays X11 channels to the
//! local display.
//!
//! The UI reads everything it shows from the session's [`SessionEvents`]
//! stream: shell output, service messages and lifecycle events.

pub mod auth;
pub mod forwarding;
pub mod scripts;
pub mod secrets;
pub mod session;
pub mod ssh;
pub mod x11;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use forwarding::{ForwardInfo, ForwardKind, ForwardedPort};
pub use secrets::{
    CredentialCache, KeyringSecretStore, MemorySecretStore, PromptProvider, PromptRequest,
    PromptResponse, SecretStore,
};
pub use session::{SessionController, SessionDeps, SessionEvent, SessionEvents, SessionState};
pub use ssh::{
    AuthKind, ConnectionProfile, ErrorClass, HostKeyPolicy, KnownHostsStore, LoginScript, SshError,
};

/// Initialize logging. `RUST_LOG` overrides the default `info` filter.
/// Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
