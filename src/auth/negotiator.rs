//! Authentication negotiator
//!
//! Walks the candidate list against the server. Passwords come from the
//! profile, then the secret store, then the user; a password the user
//! asked to remember is held in the credential cache until the outcome is
//! known and only persisted on success.

use std::sync::Arc;

use russh::keys::PrivateKey;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::transport::{Attempt, AuthTransport, KbiStep};
use super::{AuthMethod, AuthPlan};
use crate::secrets::{CredentialCache, PromptProvider, PromptRequest, SecretStore, DEFAULT_TTL};
use crate::session::EventSink;
use crate::ssh::{
    detect_agent, load_private_key, resolve_key_source, AgentLocation, AuthError, AuthKind,
    ConnectionProfile,
};

/// Password attempts per negotiation
const MAX_PASSWORD_ATTEMPTS: usize = 3;

/// Yields password candidates in source order, each source at most once
struct PasswordSupplier {
    preset: Option<Zeroizing<String>>,
    store_tried: bool,
    remembered: bool,
}

pub struct AuthNegotiator {
    profile: Arc<ConnectionProfile>,
    secrets: Arc<dyn SecretStore>,
    prompts: Arc<dyn PromptProvider>,
    cache: CredentialCache,
    events: EventSink,
    key: Option<Arc<PrivateKey>>,
    agent: Option<AgentLocation>,
}

impl AuthNegotiator {
    pub fn new(
        profile: Arc<ConnectionProfile>,
        secrets: Arc<dyn SecretStore>,
        prompts: Arc<dyn PromptProvider>,
        cache: CredentialCache,
        events: EventSink,
    ) -> Self {
        Self {
            profile,
            secrets,
            prompts,
            cache,
            events,
            key: None,
            agent: None,
        }
    }

    /// Use these credentials instead of looking them up
    pub fn with_credentials(mut self, key: Option<PrivateKey>, agent: Option<AgentLocation>) -> Self {
        self.key = key.map(Arc::new);
        self.agent = agent;
        self
    }

    /// Load the private key and find the agent, as far as the pin allows.
    /// Missing credentials only shrink the candidate list.
    pub async fn load_credentials(&mut self) {
        let profile = self.profile.clone();

        if profile.allows(AuthKind::PublicKey) {
            match resolve_key_source(&profile) {
                Some(source) => {
                    match load_private_key(&source, &self.cache, self.prompts.as_ref()).await {
                        Ok(key) => self.key = Some(Arc::new(key)),
                        Err(e) => {
                            warn!("Could not load private key: {}", e);
                            self.events
                                .service_message(format!(" X  Could not load private key: {}", e));
                        }
                    }
                }
                None => debug!("No private key configured or found"),
            }
            if self.key.is_none() && profile.auth == Some(AuthKind::PublicKey) {
                self.events
                    .service_message("Private key auth selected, but no key is loaded");
            }
        }

        if profile.allows(AuthKind::Agent) {
            self.agent = detect_agent();
            if self.agent.is_none() && profile.auth == Some(AuthKind::Agent) {
                self.events
                    .service_message("Agent auth selected, but no running agent is detected");
            }
        }
    }

    pub fn plan(&self) -> AuthPlan {
        AuthPlan::build(self.profile.auth, self.key.is_some(), self.agent.is_some())
    }

    /// Drive the candidate list to the first accepted method
    pub async fn authenticate<T>(&self, transport: &mut T) -> Result<AuthMethod, AuthError>
    where
        T: AuthTransport + ?Sized,
    {
        let mut plan = self.plan();
        let mut server_allowed: Option<Vec<AuthMethod>> = None;
        let mut tried = Vec::new();
        let mut passwords = PasswordSupplier {
            preset: self.profile.password.clone().map(Zeroizing::new),
            store_tried: false,
            remembered: false,
        };

        while let Some(method) = plan.next(server_allowed.as_deref()) {
            debug!("Trying auth method {} for {}", method, self.profile.label());
            tried.push(method.name().to_string());

            let attempt = match method {
                AuthMethod::None => transport.auth_none(&self.profile.user).await?,
                AuthMethod::PublicKey => match &self.key {
                    Some(key) => {
                        transport
                            .auth_publickey(&self.profile.user, key.clone())
                            .await?
                    }
                    None => Attempt::rejected(),
                },
                AuthMethod::Agent => match &self.agent {
                    Some(agent) => match transport.auth_agent(&self.profile.user, agent).await {
                        Ok(attempt) => attempt,
                        Err(AuthError::Agent(e)) => {
                            warn!("Agent auth failed: {}", e);
                            Attempt::rejected()
                        }
                        Err(e) => return Err(e),
                    },
                    None => Attempt::rejected(),
                },
                AuthMethod::Password => self.try_passwords(transport, &mut passwords).await?,
                AuthMethod::KeyboardInteractive => self.keyboard_interactive(transport).await?,
                AuthMethod::HostBased => {
                    info!("Host-based authentication is not available, skipping");
                    Attempt::rejected()
                }
            };

            match attempt {
                Attempt::Accepted => {
                    info!("Authenticated {} with {}", self.profile.label(), method);
                    self.persist_password(passwords.remembered);
                    return Ok(method);
                }
                Attempt::Rejected { remaining } => {
                    debug!("Auth method {} rejected", method);
                    if remaining.is_some() {
                        server_allowed = remaining;
                    }
                }
            }
        }

        let key = self.profile.secret_key();
        self.cache.forget(&key);
        if let Err(e) = self.secrets.delete_secret(&key) {
            warn!("Failed to delete stored password: {}", e);
        }
        Err(AuthError::Exhausted { tried })
    }

    async fn try_passwords<T>(
        &self,
        transport: &mut T,
        passwords: &mut PasswordSupplier,
    ) -> Result<Attempt, AuthError>
    where
        T: AuthTransport + ?Sized,
    {
        let mut last = Attempt::rejected();
        for _ in 0..MAX_PASSWORD_ATTEMPTS {
            let Some(password) = self.next_password(passwords).await else {
                debug!("No password available");
                break;
            };
            last = transport
                .auth_password(&self.profile.user, &password)
                .await?;
            if last == Attempt::Accepted {
                break;
            }
            // A server that no longer lists password will not change its mind
            if let Attempt::Rejected {
                remaining: Some(remaining),
            } = &last
            {
                if !remaining.contains(&AuthMethod::Password) {
                    break;
                }
            }
        }
        Ok(last)
    }

    /// `None` (or an empty answer) fails the attempt
    async fn next_password(&self, passwords: &mut PasswordSupplier) -> Option<Zeroizing<String>> {
        if let Some(preset) = passwords.preset.take().filter(|p| !p.is_empty()) {
            self.events.service_message("Using preset password");
            return Some(preset);
        }

        let key = self.profile.secret_key();
        if !passwords.store_tried {
            passwords.store_tried = true;
            match self.secrets.load_secret(&key) {
                Ok(Some(stored)) if !stored.is_empty() => {
                    self.events.service_message("Trying saved password");
                    return Some(Zeroizing::new(stored));
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to load stored password: {}", e),
            }
        }

        let request =
            PromptRequest::secret(format!("Password for {}", self.profile.label())).with_remember();
        let response = self.prompts.prompt_secret(request).await?;
        if response.value.is_empty() {
            return None;
        }
        if response.remember {
            self.cache.remember(&key, &response.value, DEFAULT_TTL);
            passwords.remembered = true;
        }
        Some(response.value)
    }

    fn persist_password(&self, remembered: bool) {
        if !remembered {
            return;
        }
        let key = self.profile.secret_key();
        if let Some(password) = self.cache.take(&key) {
            match self.secrets.save_secret(&key, &password) {
                Ok(()) => debug!("Saved password for {}", self.profile.label()),
                Err(e) => warn!("Failed to save password: {}", e),
            }
        }
    }

    async fn keyboard_interactive<T>(&self, transport: &mut T) -> Result<Attempt, AuthError>
    where
        T: AuthTransport + ?Sized,
    {
        let mut step = transport.kbi_start(&self.profile.user).await?;
        loop {
            let (name, instructions, prompts) = match step {
                KbiStep::Done(attempt) => return Ok(attempt),
                KbiStep::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => (name, instructions, prompts),
            };

            self.events.service_message(format!(
                "Keyboard-interactive auth requested: {}",
                name
            ));
            if !instructions.is_empty() {
                self.events.service_message(instructions);
            }

            let mut responses = Vec::with_capacity(prompts.len());
            for prompt in prompts {
                let request = PromptRequest {
                    label: prompt.prompt,
                    is_password: !prompt.echo,
                    offer_remember: false,
                };
                let answer = self
                    .prompts
                    .prompt_secret(request)
                    .await
                    .map(|r| r.value.to_string())
                    .unwrap_or_default();
                responses.push(answer);
            }

            step = transport.kbi_respond(responses).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::KbiPrompt;
    use crate::secrets::{MemorySecretStore, PromptResponse};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Records every request; the verdict comes from `accept`
    struct ScriptedTransport {
        log: Vec<String>,
        accept: Box<dyn Fn(&str) -> bool + Send>,
        remaining: Option<Vec<AuthMethod>>,
        kbi_rounds: VecDeque<KbiStep>,
    }

    impl ScriptedTransport {
        fn new(accept: impl Fn(&str) -> bool + Send + 'static) -> Self {
            Self {
                log: Vec::new(),
                accept: Box::new(accept),
                remaining: None,
                kbi_rounds: VecDeque::new(),
            }
        }

        fn verdict(&mut self, entry: String) -> Attempt {
            let ok = (self.accept)(&entry);
            self.log.push(entry);
            if ok {
                Attempt::Accepted
            } else {
                Attempt::Rejected {
                    remaining: self.remaining.clone(),
                }
            }
        }
    }

    #[async_trait]
    impl AuthTransport for ScriptedTransport {
        async fn auth_none(&mut self, _user: &str) -> Result<Attempt, AuthError> {
            Ok(self.verdict("none".into()))
        }

        async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Attempt, AuthError> {
            Ok(self.verdict(format!("password:{}", password)))
        }

        async fn auth_publickey(
            &mut self,
            _user: &str,
            _key: Arc<PrivateKey>,
        ) -> Result<Attempt, AuthError> {
            Ok(self.verdict("publickey".into()))
        }

        async fn auth_agent(
            &mut self,
            _user: &str,
            _agent: &AgentLocation,
        ) -> Result<Attempt, AuthError> {
            Ok(self.verdict("agent".into()))
        }

        async fn kbi_start(&mut self, _user: &str) -> Result<KbiStep, AuthError> {
            self.log.push("kbi".into());
            Ok(self
                .kbi_rounds
                .pop_front()
                .unwrap_or(KbiStep::Done(Attempt::rejected())))
        }

        async fn kbi_respond(&mut self, responses: Vec<String>) -> Result<KbiStep, AuthError> {
            let entry = format!("kbi:{}", responses.join(","));
            let verdict = self.verdict(entry);
            Ok(self.kbi_rounds.pop_front().unwrap_or(KbiStep::Done(verdict)))
        }
    }

    /// Answers prompts from a queue; an empty queue means "cancel"
    #[derive(Default)]
    struct ScriptedPrompts {
        answers: Mutex<VecDeque<PromptResponse>>,
        asked: Mutex<Vec<PromptRequest>>,
    }

    impl ScriptedPrompts {
        fn answering(answers: Vec<PromptResponse>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                asked: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl PromptProvider for ScriptedPrompts {
        async fn prompt_secret(&self, request: PromptRequest) -> Option<PromptResponse> {
            self.asked.lock().push(request);
            self.answers.lock().pop_front()
        }
    }

    struct Fixture {
        negotiator: AuthNegotiator,
        secrets: Arc<MemorySecretStore>,
        prompts: Arc<ScriptedPrompts>,
    }

    fn fixture(profile: ConnectionProfile, secrets: MemorySecretStore, prompts: ScriptedPrompts) -> Fixture {
        let secrets = Arc::new(secrets);
        let prompts = Arc::new(prompts);
        let (events, _rx) = EventSink::channel("test");
        let negotiator = AuthNegotiator::new(
            Arc::new(profile),
            secrets.clone(),
            prompts.clone(),
            CredentialCache::new(),
            events,
        );
        Fixture {
            negotiator,
            secrets,
            prompts,
        }
    }

    fn test_key() -> PrivateKey {
        use russh::keys::ssh_key::private::{Ed25519Keypair, KeypairData};
        let keypair = Ed25519Keypair::from_seed(&[7u8; 32]);
        PrivateKey::new(KeypairData::from(keypair), "test").unwrap()
    }

    #[cfg(unix)]
    fn test_agent() -> AgentLocation {
        AgentLocation::UnixSocket("/tmp/agent.sock".into())
    }

    #[tokio::test]
    async fn test_preset_password_without_prompt() {
        let mut profile = ConnectionProfile::new("host", 22, "bob");
        profile.password = Some("x".into());
        let f = fixture(profile, MemorySecretStore::new(), ScriptedPrompts::default());
        let mut transport = ScriptedTransport::new(|e| e == "password:x");

        let method = f.negotiator.authenticate(&mut transport).await.unwrap();
        assert_eq!(method, AuthMethod::Password);
        assert_eq!(transport.log, vec!["none", "password:x"]);
        assert!(f.prompts.asked.lock().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_candidates_in_fixed_order() {
        let profile = ConnectionProfile::new("host", 22, "bob");
        let f = fixture(profile, MemorySecretStore::new(), ScriptedPrompts::default());
        let negotiator = f
            .negotiator
            .with_credentials(Some(test_key()), Some(test_agent()));
        let mut transport = ScriptedTransport::new(|_| false);

        let err = negotiator.authenticate(&mut transport).await.unwrap_err();
        // Password prompt is cancelled, so no password request reaches the server
        assert_eq!(transport.log, vec!["none", "publickey", "agent", "kbi"]);
        match err {
            AuthError::Exhausted { tried } => assert_eq!(
                tried,
                vec![
                    "none",
                    "publickey",
                    "agent",
                    "password",
                    "keyboard-interactive",
                    "hostbased"
                ]
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stops_at_first_accepted() {
        let profile = ConnectionProfile::new("host", 22, "bob");
        let f = fixture(profile, MemorySecretStore::new(), ScriptedPrompts::default());
        let negotiator = f
            .negotiator
            .with_credentials(Some(test_key()), Some(test_agent()));
        let mut transport = ScriptedTransport::new(|e| e == "publickey");

        assert_eq!(
            negotiator.authenticate(&mut transport).await.unwrap(),
            AuthMethod::PublicKey
        );
        assert_eq!(transport.log, vec!["none", "publickey"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pinned_method_only() {
        let mut profile = ConnectionProfile::new("host", 22, "bob");
        profile.auth = Some(AuthKind::Agent);
        profile.password = Some("x".into());
        let f = fixture(profile, MemorySecretStore::new(), ScriptedPrompts::default());
        let negotiator = f
            .negotiator
            .with_credentials(Some(test_key()), Some(test_agent()));
        let mut transport = ScriptedTransport::new(|_| false);

        assert!(negotiator.authenticate(&mut transport).await.is_err());
        assert_eq!(transport.log, vec!["none", "agent"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_agent_survives_server_method_list() {
        let profile = ConnectionProfile::new("host", 22, "bob");
        let f = fixture(profile, MemorySecretStore::new(), ScriptedPrompts::default());
        let negotiator = f.negotiator.with_credentials(None, Some(test_agent()));
        let mut transport = ScriptedTransport::new(|e| e == "agent");
        transport.remaining = Some(vec![AuthMethod::Password]);

        assert_eq!(
            negotiator.authenticate(&mut transport).await.unwrap(),
            AuthMethod::Agent
        );
    }

    #[tokio::test]
    async fn test_server_list_skips_methods() {
        let profile = ConnectionProfile::new("host", 22, "bob");
        let f = fixture(profile, MemorySecretStore::new(), ScriptedPrompts::default());
        let mut transport = ScriptedTransport::new(|_| false);
        transport.remaining = Some(vec![AuthMethod::PublicKey]);

        assert!(f.negotiator.authenticate(&mut transport).await.is_err());
        assert_eq!(transport.log, vec!["none"]);
        assert!(f.prompts.asked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_password_sources_in_order() {
        let mut profile = ConnectionProfile::new("host", 22, "bob");
        profile.password = Some("preset".into());
        let key = profile.secret_key();
        let f = fixture(
            profile,
            MemorySecretStore::new().with_secret(key.clone(), "stored"),
            ScriptedPrompts::answering(vec![PromptResponse::remembered("typed")]),
        );
        let mut transport = ScriptedTransport::new(|e| e == "password:typed");

        f.negotiator.authenticate(&mut transport).await.unwrap();
        assert_eq!(
            transport.log,
            vec!["none", "password:preset", "password:stored", "password:typed"]
        );

        let asked = f.prompts.asked.lock();
        assert_eq!(asked.len(), 1);
        assert_eq!(asked[0].label, "Password for bob@host");
        assert!(asked[0].is_password && asked[0].offer_remember);
        // Remembered password is persisted on success
        assert_eq!(f.secrets.load_secret(&key).unwrap().as_deref(), Some("typed"));
    }

    #[tokio::test]
    async fn test_exhaustion_deletes_stored_password() {
        let mut profile = ConnectionProfile::new("host", 22, "bob");
        profile.auth = Some(AuthKind::Password);
        let key = profile.secret_key();
        let f = fixture(
            profile,
            MemorySecretStore::new().with_secret(key.clone(), "stale"),
            ScriptedPrompts::default(),
        );
        let mut transport = ScriptedTransport::new(|_| false);

        let err = f.negotiator.authenticate(&mut transport).await.unwrap_err();
        assert!(matches!(err, AuthError::Exhausted { .. }));
        assert_eq!(transport.log, vec!["none", "password:stale"]);
        assert!(!f.secrets.contains(&key));
    }

    #[tokio::test]
    async fn test_unremembered_password_is_not_saved() {
        let profile = ConnectionProfile::new("host", 22, "bob");
        let key = profile.secret_key();
        let f = fixture(
            profile,
            MemorySecretStore::new(),
            ScriptedPrompts::answering(vec![PromptResponse::new("pw")]),
        );
        let mut transport = ScriptedTransport::new(|e| e == "password:pw");

        f.negotiator.authenticate(&mut transport).await.unwrap();
        assert!(!f.secrets.contains(&key));
    }

    #[tokio::test]
    async fn test_keyboard_interactive_rounds() {
        let mut profile = ConnectionProfile::new("host", 22, "bob");
        profile.auth = Some(AuthKind::KeyboardInteractive);
        let f = fixture(
            profile,
            MemorySecretStore::new(),
            ScriptedPrompts::answering(vec![PromptResponse::new("123456")]),
        );
        let mut transport = ScriptedTransport::new(|e| e == "kbi:123456,");
        transport.kbi_rounds.push_back(KbiStep::InfoRequest {
            name: "2FA".into(),
            instructions: String::new(),
            prompts: vec![
                KbiPrompt {
                    prompt: "Code: ".into(),
                    echo: true,
                },
                KbiPrompt {
                    prompt: "Password: ".into(),
                    echo: false,
                },
            ],
        });

        assert_eq!(
            f.negotiator.authenticate(&mut transport).await.unwrap(),
            AuthMethod::KeyboardInteractive
        );

        // The second prompt was cancelled and answered with ""
        let asked = f.prompts.asked.lock();
        assert_eq!(asked.len(), 2);
        assert!(!asked[0].is_password);
        assert!(asked[1].is_password);
    }
}
