//! SSH agent authentication
//!
//! Signing is delegated to the system agent:
//! - Unix: the socket named by `SSH_AUTH_SOCK`
//! - Windows: the OpenSSH named pipe `\\.\pipe\openssh-ssh-agent`

use std::future::Future;
#[cfg(unix)]
use std::path::PathBuf;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::AuthError;

#[cfg(windows)]
const OPENSSH_PIPE: &str = r"\\.\pipe\openssh-ssh-agent";

/// Where the agent was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentLocation {
    #[cfg(unix)]
    UnixSocket(PathBuf),
    #[cfg(windows)]
    NamedPipe(String),
}

impl std::fmt::Display for AgentLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(unix)]
            AgentLocation::UnixSocket(path) => write!(f, "{}", path.display()),
            #[cfg(windows)]
            AgentLocation::NamedPipe(name) => f.write_str(name),
        }
    }
}

/// Locate a running agent. `None` removes `agent` from the auth candidates.
pub fn detect_agent() -> Option<AgentLocation> {
    #[cfg(unix)]
    {
        let path = PathBuf::from(std::env::var_os("SSH_AUTH_SOCK")?);
        path.exists().then_some(AgentLocation::UnixSocket(path))
    }

    #[cfg(windows)]
    {
        // The pipe exists only while the agent service runs
        std::path::Path::new(OPENSSH_PIPE)
            .exists()
            .then(|| AgentLocation::NamedPipe(OPENSSH_PIPE.to_string()))
    }

    #[cfg(not(any(unix, windows)))]
    {
        None
    }
}

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// [`Signer`] over a borrowed agent. The key is cloned before the future is
/// built so the returned future stays `Send`.
struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            self.agent
                .sign_request(&key, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

pub struct SshAgentClient {
    agent: DynAgent,
}

impl SshAgentClient {
    pub async fn connect(location: &AgentLocation) -> Result<Self, AuthError> {
        debug!("Connecting to SSH agent at {}", location);

        let agent = match location {
            #[cfg(unix)]
            AgentLocation::UnixSocket(path) => AgentClient::connect_uds(path)
                .await
                .map_err(|e| AuthError::Agent(format!("{}: {}", path.display(), e)))?
                .dynamic(),
            #[cfg(windows)]
            AgentLocation::NamedPipe(name) => AgentClient::connect_named_pipe(name)
                .await
                .map_err(|e| AuthError::Agent(format!("{}: {}", name, e)))?
                .dynamic(),
        };

        Ok(Self { agent })
    }

    /// Offer every agent identity in turn. `Ok(false)` when none was accepted.
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        user: &str,
    ) -> Result<bool, AuthError> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| AuthError::Agent(format!("Failed to list agent keys: {}", e)))?;

        if keys.is_empty() {
            info!("SSH agent holds no keys");
            return Ok(false);
        }

        let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();

        for key in keys {
            debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());
            let comment = key.comment().to_string();
            match handle
                .authenticate_publickey_with(
                    user,
                    key,
                    hash_alg,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await
            {
                Ok(result) if result.success() => {
                    info!("Agent key accepted: {}", comment);
                    return Ok(true);
                }
                Ok(_) => debug!("Agent key rejected: {}", comment),
                Err(e) => warn!("Agent signing failed for {}: {}", comment, e),
            }
        }

        Ok(false)
    }
}
