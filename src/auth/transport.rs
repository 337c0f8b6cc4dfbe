//! The auth-facing slice of the transport
//!
//! The negotiator only needs to send one request at a time and read the
//! server's verdict. russh's `Handle` implements this directly.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PrivateKey;
use russh::MethodKind;

use super::AuthMethod;
use crate::ssh::{AgentLocation, AuthError, ClientHandler, SshAgentClient};

/// Server verdict on one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Accepted,
    /// `remaining` is the server's "can continue" list when it sent one
    Rejected { remaining: Option<Vec<AuthMethod>> },
}

impl Attempt {
    pub fn rejected() -> Self {
        Attempt::Rejected { remaining: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KbiPrompt {
    pub prompt: String,
    pub echo: bool,
}

/// One keyboard-interactive round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KbiStep {
    Done(Attempt),
    InfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<KbiPrompt>,
    },
}

#[async_trait]
pub trait AuthTransport: Send {
    async fn auth_none(&mut self, user: &str) -> Result<Attempt, AuthError>;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Attempt, AuthError>;

    async fn auth_publickey(&mut self, user: &str, key: Arc<PrivateKey>) -> Result<Attempt, AuthError>;

    async fn auth_agent(&mut self, user: &str, agent: &AgentLocation) -> Result<Attempt, AuthError>;

    async fn kbi_start(&mut self, user: &str) -> Result<KbiStep, AuthError>;

    async fn kbi_respond(&mut self, responses: Vec<String>) -> Result<KbiStep, AuthError>;
}

fn method_from_kind(kind: &MethodKind) -> AuthMethod {
    match kind {
        MethodKind::None => AuthMethod::None,
        MethodKind::Password => AuthMethod::Password,
        MethodKind::PublicKey => AuthMethod::PublicKey,
        MethodKind::HostBased => AuthMethod::HostBased,
        MethodKind::KeyboardInteractive => AuthMethod::KeyboardInteractive,
    }
}

fn attempt(result: AuthResult) -> Attempt {
    match result {
        AuthResult::Success => Attempt::Accepted,
        AuthResult::Failure {
            remaining_methods, ..
        } => Attempt::Rejected {
            remaining: Some(remaining_methods.iter().map(method_from_kind).collect()),
        },
    }
}

fn kbi_step(response: KeyboardInteractiveAuthResponse) -> KbiStep {
    match response {
        KeyboardInteractiveAuthResponse::Success => KbiStep::Done(Attempt::Accepted),
        KeyboardInteractiveAuthResponse::Failure {
            remaining_methods, ..
        } => KbiStep::Done(Attempt::Rejected {
            remaining: Some(remaining_methods.iter().map(method_from_kind).collect()),
        }),
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => KbiStep::InfoRequest {
            name,
            instructions,
            prompts: prompts
                .into_iter()
                .map(|p| KbiPrompt {
                    prompt: p.prompt,
                    echo: p.echo,
                })
                .collect(),
        },
    }
}

fn transport_err(e: russh::Error) -> AuthError {
    AuthError::Transport(e.to_string())
}

#[async_trait]
impl AuthTransport for Handle<ClientHandler> {
    async fn auth_none(&mut self, user: &str) -> Result<Attempt, AuthError> {
        self.authenticate_none(user)
            .await
            .map(attempt)
            .map_err(transport_err)
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Attempt, AuthError> {
        self.authenticate_password(user, password)
            .await
            .map(attempt)
            .map_err(transport_err)
    }

    async fn auth_publickey(&mut self, user: &str, key: Arc<PrivateKey>) -> Result<Attempt, AuthError> {
        // Only RSA keys care about the hash; others ignore it
        let hash_alg = self.best_supported_rsa_hash().await.ok().flatten().flatten();
        self.authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
            .await
            .map(attempt)
            .map_err(transport_err)
    }

    async fn auth_agent(&mut self, user: &str, agent: &AgentLocation) -> Result<Attempt, AuthError> {
        let mut client = SshAgentClient::connect(agent).await?;
        if client.authenticate(self, user).await? {
            Ok(Attempt::Accepted)
        } else {
            Ok(Attempt::rejected())
        }
    }

    async fn kbi_start(&mut self, user: &str) -> Result<KbiStep, AuthError> {
        self.authenticate_keyboard_interactive_start(user, None::<String>)
            .await
            .map(kbi_step)
            .map_err(transport_err)
    }

    async fn kbi_respond(&mut self, responses: Vec<String>) -> Result<KbiStep, AuthError> {
        self.authenticate_keyboard_interactive_respond(responses)
            .await
            .map(kbi_step)
            .map_err(transport_err)
    }
}
